//! JSON-lines network event pipe
//!
//! A platform shim writes one [`RawNetworkEvent`] per line, e.g.
//! `{"event":"available","network":101}`. Blank lines and `#` comments
//! are skipped; malformed lines are logged and dropped.

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};
use veil_network::{ChannelSource, RawNetworkEvent};

/// Feed every event from `reader` into `source` until EOF.
///
/// Returns the number of events delivered.
pub async fn pump_events<R>(reader: R, source: Arc<ChannelSource>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut delivered = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<RawNetworkEvent>(line) {
            Ok(event) => {
                debug!("Network event: {}", event.kind());
                source.emit(event);
                delivered += 1;
            }
            Err(e) => warn!("Ignoring malformed event line: {}", e),
        }
    }

    Ok(delivered)
}
