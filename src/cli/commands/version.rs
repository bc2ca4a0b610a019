//! Version command implementation.

use crate::error::Result;
use crate::sync::rest::MAX_COMPOSITE_SUBREQUESTS;
use serde::Serialize;

#[derive(Serialize)]
struct VersionOutput<'a> {
    version: &'a str,
    build: &'a str,
    api_version: &'a str,
    max_batch_size: usize,
}

/// Execute the version command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let build = if cfg!(debug_assertions) { "dev" } else { "release" };
    let api_version = crate::config::DEFAULT_API_VERSION;

    if json {
        let output = VersionOutput {
            version,
            build,
            api_version,
            max_batch_size: MAX_COMPOSITE_SUBREQUESTS,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("soupsync {version} ({build}, default API {api_version})");
    Ok(())
}
