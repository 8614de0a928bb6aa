// Exchange assertion
//
// Guarantees a durable fanout exchange exists before a publish, answering
// from the exchange cache when the current link already confirmed the name.

use crate::broker::error::{BrokerError, LinkError};
use crate::broker::manager::ConnectionManager;
use crate::metrics;
use tracing::{debug, warn};

impl ConnectionManager {
    /// Make sure `name` exists on the broker as a durable fanout exchange
    ///
    /// A declare with incompatible parameters (other type or durability) fails
    /// and is returned as-is; it is never retried with different arguments.
    pub async fn ensure_exchange(&self, name: &str) -> Result<(), LinkError> {
        let (channel, epoch) = {
            let st = self.state();
            let channel = st.channel.clone().ok_or_else(LinkError::unavailable)?;
            if st.cache.contains(name) {
                metrics::EXCHANGE_CACHE_HITS_TOTAL.inc();
                debug!(exchange = name, "Exchange confirmed from cache");
                return Ok(());
            }
            (channel, st.epoch)
        };

        let after = self.operation_timeout();
        let declared = tokio::time::timeout(after, channel.declare_fanout(name))
            .await
            .unwrap_or(Err(BrokerError::Timeout {
                operation: "exchange declare",
                after,
            }));

        let mut st = self.state();
        match declared {
            Ok(()) => {
                metrics::EXCHANGE_DECLARES_TOTAL
                    .with_label_values(&["ok"])
                    .inc();
                // A disconnect while we were declaring already cleared the cache
                // and the confirmation belongs to a link that no longer exists
                if st.epoch == epoch && st.channel.is_some() {
                    st.cache.add(name);
                }
                debug!(exchange = name, "Exchange asserted");
                Ok(())
            }
            Err(err) => {
                metrics::EXCHANGE_DECLARES_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                st.cache.remove(name);
                warn!(exchange = name, "Exchange assertion failed: {}", err);
                let err = match err {
                    BrokerError::ExchangeAssertion { .. } => err,
                    other => BrokerError::ExchangeAssertion {
                        exchange: name.to_string(),
                        message: other.to_string(),
                    },
                };
                Err(LinkError::new(Some(epoch), err))
            }
        }
    }
}
