//! Fixed module list from configuration

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DiscoveryEvent, DiscoverySource};
use crate::Result;

/// Announces each configured module once, then ends
#[derive(Debug, Clone)]
pub struct StaticSource {
    names: Vec<String>,
}

impl StaticSource {
    /// Source over a list of module names
    #[must_use]
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn label(&self) -> &'static str {
        "static"
    }

    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        for name in self.names {
            if shutdown.is_cancelled() {
                break;
            }
            if events.send(DiscoveryEvent::Added(name)).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
