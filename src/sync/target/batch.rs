//! Sync up through composite requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::id_string;
use super::up::{
    blocked_by_merge_mode, entry_id, fields_to_send, on_create_response, on_delete_response,
    on_update_response, record_failure, StandardSyncUpTarget, UpAction, UpServer,
};
use crate::error::Result;
use crate::model::SyncOptions;
use crate::sync::rest::{parse_composite_response, RestRequest, RestResponse, MAX_COMPOSITE_SUBREQUESTS};
use crate::sync::SyncContext;

fn default_max_batch_size() -> usize {
    MAX_COMPOSITE_SUBREQUESTS
}

/// Uploads up to `maxBatchSize` records per composite request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncUpTarget {
    #[serde(flatten)]
    pub base: StandardSyncUpTarget,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for BatchSyncUpTarget {
    fn default() -> Self {
        Self {
            base: StandardSyncUpTarget::default(),
            max_batch_size: MAX_COMPOSITE_SUBREQUESTS,
        }
    }
}

struct Pending {
    record: Value,
    action: UpAction,
    object_type: String,
}

impl BatchSyncUpTarget {
    /// Records per composite request, capped by the server limit.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.max_batch_size.clamp(1, MAX_COMPOSITE_SUBREQUESTS)
    }

    fn request_for(&self, ctx: &SyncContext<'_>, pending: &Pending, options: &SyncOptions) -> RestRequest {
        let id = pending
            .record
            .get(&self.base.fields.id_field_name)
            .and_then(id_string)
            .unwrap_or_default();
        match pending.action {
            UpAction::Create => {
                let fields = fields_to_send(&self.base, &pending.record, self.base.create_field_list(), options);
                ctx.api.create(&pending.object_type, fields)
            }
            UpAction::Update => {
                let fields = fields_to_send(&self.base, &pending.record, self.base.update_field_list(), options);
                ctx.api.update(&pending.object_type, &id, fields)
            }
            _ => ctx.api.delete(&pending.object_type, &id),
        }
    }

    pub(crate) fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        ids: &[i64],
        options: &SyncOptions,
    ) -> Result<()> {
        let mut pending = Vec::new();
        for mut record in ctx.store.retrieve(soup, ids)? {
            let action = UpAction::for_record(&record);
            match action {
                UpAction::Skip => continue,
                UpAction::DeleteLocalOnly => {
                    ctx.store.delete(soup, &[entry_id(&record)?])?;
                    continue;
                }
                _ => {}
            }
            if blocked_by_merge_mode(&self.base, ctx, &record, action)? {
                info!(sync_id = ctx.sync_id, soup, "Server copy is newer, leaving record alone");
                continue;
            }
            let Some(object_type) = self.base.object_type(&record) else {
                let response = RestResponse::new(0, Value::String("record has no object type".to_string()));
                record_failure(ctx, soup, &mut record, &response)?;
                continue;
            };
            pending.push(Pending {
                record,
                action,
                object_type,
            });
        }
        if pending.is_empty() {
            return Ok(());
        }
        ctx.check_if_stopped()?;

        let requests = pending
            .iter()
            .map(|p| Ok((entry_id(&p.record)?.to_string(), self.request_for(ctx, p, options))))
            .collect::<Result<Vec<_>>>()?;
        debug!(sync_id = ctx.sync_id, soup, count = requests.len(), "Sending composite request");
        let response = ctx.send(&ctx.api.composite(false, &requests))?.into_result()?;
        let mut responses = parse_composite_response(&response)?;

        for (mut p, (reference_id, _)) in pending.into_iter().zip(requests) {
            let sub = responses.remove(&reference_id).unwrap_or_else(|| {
                RestResponse::new(0, Value::String("no response for subrequest".to_string()))
            });
            match p.action {
                UpAction::Create => {
                    on_create_response(ctx, soup, &self.base.fields.id_field_name, &mut p.record, &sub)?;
                }
                UpAction::Update => {
                    on_update_response(&self.base, ctx, soup, &mut p.record, &p.object_type, &sub, options)?;
                }
                _ => {
                    on_delete_response(ctx, soup, &mut p.record, &sub)?;
                }
            }
        }
        Ok(())
    }
}
