//! L1-height resolution. The Monitor calls this before applying
//! `blockDelay`.

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait HeightResolver: Send + Sync {
    /// Maps an observed chain height to the height the Monitor should treat
    /// as "current" before subtracting `blockDelay`. For an L1-native chain
    /// this is the identity function.
    async fn resolve(&self, observed_height: u64) -> eyre::Result<u64>;
}

/// L1-native chains: observed height is already final-candidate height.
pub struct PassthroughResolver;

#[async_trait]
impl HeightResolver for PassthroughResolver {
    async fn resolve(&self, observed_height: u64) -> eyre::Result<u64> {
        Ok(observed_height)
    }
}

/// Rollup-specific L2→L1 resolution (e.g. Arbitrum's L1 batch-posting delay)
/// is out of scope; this stub logs once and otherwise behaves as a
/// passthrough so a misconfigured L2 chain does not silently stall.
pub struct UnimplementedL2Resolver {
    warned: std::sync::atomic::AtomicBool,
}

impl Default for UnimplementedL2Resolver {
    fn default() -> Self {
        Self {
            warned: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl HeightResolver for UnimplementedL2Resolver {
    async fn resolve(&self, observed_height: u64) -> eyre::Result<u64> {
        if !self.warned.swap(true, std::sync::atomic::Ordering::Relaxed) {
            warn!("using passthrough resolver: rollup-specific L1 height resolution is not implemented");
        }
        Ok(observed_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_is_identity() {
        let resolver = PassthroughResolver;
        assert_eq!(resolver.resolve(42).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn l2_stub_warns_once_and_passes_through() {
        let resolver = UnimplementedL2Resolver::default();
        assert_eq!(resolver.resolve(10).await.unwrap(), 10);
        assert_eq!(resolver.resolve(11).await.unwrap(), 11);
    }
}
