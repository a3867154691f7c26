use crate::AppState;
use sync_core::protocol::{PullResponse, PushResponse, RealtimeEvent, Request, Response, CURRENT_SCHEMA_VERSION};
use sync_core::{SyncError, SyncResult};

/// Dispatches one combined push/pull envelope against the commit log,
/// matching the algorithm in the commit-log & push pipeline and the
/// snapshot + pull pipeline. Both the HTTP and WebSocket transports share
/// this function; they only differ in framing and connection lifecycle.
#[tracing::instrument(skip(state, request), fields(client_id = %request.client_id))]
pub async fn handle_request(state: &AppState, request: Request) -> SyncResult<Response> {
    let mut response = Response::default();

    if let Some(push) = request.push {
        if push.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(SyncError::SchemaMismatch {
                server_version: CURRENT_SCHEMA_VERSION,
                client_version: push.schema_version,
            });
        }

        let (accepted_commit_seq, conflicts) = state
            .db
            .push(
                &state.partition_id,
                push.client_id,
                push.client_commit_id,
                None,
                &push.operations,
                |table, _row_id, payload| state.scope_engine.resolve_scope_keys(table, payload),
            )
            .await?;

        if conflicts.is_empty() {
            publish_commit(state, accepted_commit_seq, push.client_id).await;
        }

        response.push = Some(PushResponse { accepted_commit_seq, conflicts });
    }

    if let Some(pull) = request.pull {
        let limit_snapshot_rows = pull.limit_snapshot_rows.unwrap_or(500);
        let (snapshots, changes, subscription_states, more) = state
            .db
            .pull(
                &state.partition_id,
                &pull.subscriptions,
                pull.limit_commits,
                limit_snapshot_rows,
                pull.max_snapshot_pages,
                pull.dedupe_rows,
            )
            .await?;

        let cursor = subscription_states
            .iter()
            .filter_map(|s| match s.bootstrap_state {
                Some(sync_core::models::BootstrapState::CaughtUp { cursor }) => Some(cursor),
                _ => None,
            })
            .min()
            .unwrap_or(0);

        state
            .db
            .upsert_cursor(&state.partition_id, pull.client_id, cursor, &pull_scopes(&pull.subscriptions))
            .await?;

        response.pull = Some(PullResponse { snapshots, changes, cursor, subscription_states, more });
    }

    Ok(response)
}

fn pull_scopes(subscriptions: &[sync_core::protocol::Sub]) -> Vec<String> {
    subscriptions.iter().flat_map(|s| s.scopes.clone()).collect()
}

/// `source_instance_id` carries the pushing client's own id, not the
/// server's: that lets the pushing client's own other connections
/// recognise and suppress the echo of a commit they already know about
/// from their push response, while every other client still wakes up.
async fn publish_commit(state: &AppState, commit_seq: i64, source_client_id: uuid::Uuid) {
    if commit_seq == 0 {
        return;
    }
    let event = RealtimeEvent::Commit {
        commit_seq,
        partition_id: Some(state.partition_id.clone()),
        scope_keys: Vec::new(),
        source_instance_id: Some(source_client_id),
    };
    if let Err(err) = state.broadcaster.publish(&state.partition_id, event).await {
        tracing::warn!(?err, "failed to publish realtime commit event");
    }
}
