//! Offline replay of recorded traffic

use anyhow::{Context, Result};
use axon_core::InboundMessage;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

use crate::state::AppState;

/// One recorded inbound message
#[derive(Deserialize)]
struct RecordedMessage {
    topic: String,
    payload: Value,
}

impl RecordedMessage {
    fn into_inbound(self) -> Result<InboundMessage> {
        let payload = match self.payload {
            Value::String(raw) => raw.into_bytes(),
            other => serde_json::to_vec(&other)?,
        };
        Ok(InboundMessage {
            topic: self.topic,
            payload,
        })
    }
}

/// Feed a JSON-lines recording through the bridge, returning how many lines were applied
pub async fn replay_file(state: &AppState, path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read replay file {}", path.display()))?;

    let mut applied = 0;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let recorded: RecordedMessage = serde_json::from_str(line)
            .with_context(|| format!("Invalid replay record on line {}", index + 1))?;
        let msg = recorded.into_inbound()?;
        let routed = state.bridge.handle(&msg).await;
        debug!(
            line = index + 1,
            topic = %msg.topic,
            replaced = routed.snapshots_replaced,
            patched = routed.snapshots_patched,
            "Replayed message"
        );
        applied += 1;
    }

    info!(path = %path.display(), messages = applied, "Replay finished");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use std::io::Write;

    const LVL_ADDR: &str = "/rt:dev/rn:zw/ad:1/sv:out_lvl_switch/ad:3_0";

    #[tokio::test]
    async fn test_replay_builds_snapshots() {
        let report = json!({"topic": "pt:j1/mt:rsp/rt:app/rn:axon/ad:1", "payload": {
            "type": "evt.pd7.response",
            "val": {"param": {"state": {"devices": [{"id": 3, "services": [
                {"name": "out_lvl_switch", "addr": LVL_ADDR, "attributes": [
                    {"name": "lvl", "values": [{"val": 10}]}
                ]}
            ]}]}}}
        }});
        let update = json!({"topic": format!("pt:j1/mt:evt{}", LVL_ADDR), "payload": {
            "type": "evt.lvl.report", "serv": "out_lvl_switch", "val": 40
        }});

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", report).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{}", update).unwrap();
        writeln!(file, "{}", json!({"topic": "pt:j1/mt:evt/x", "payload": "garbage"})).unwrap();

        let state = AppState::new(Config::default()).await.unwrap();
        let applied = replay_file(&state, file.path()).await.unwrap();
        assert_eq!(applied, 3);

        let snapshots = state.snapshots().await;
        assert_eq!(snapshots["axon/state/3/state"][LVL_ADDR]["lvl"], json!(40));
    }

    #[tokio::test]
    async fn test_replay_rejects_bad_record() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"payload\": 1}}").unwrap();

        let state = AppState::new(Config::default()).await.unwrap();
        assert!(replay_file(&state, file.path()).await.is_err());
    }
}
