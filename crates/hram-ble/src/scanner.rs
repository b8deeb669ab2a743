//! Heart-rate sensor discovery

use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{HramError, Result};
use crate::gatt::HEART_RATE_SERVICE;
use crate::model::{Advertisement, Identifier};
use crate::platform::{AdvertisementStream, Central};

/// Scans for peripherals advertising the Heart Rate service
#[derive(Clone)]
pub struct Scanner {
    central: Arc<dyn Central>,
    service: Uuid,
}

impl Scanner {
    /// Create a scanner on `central`
    pub fn new(central: Arc<dyn Central>) -> Self {
        Self {
            central,
            service: HEART_RATE_SERVICE,
        }
    }

    /// Advertisements from heart-rate sensors
    ///
    /// The scan starts on first poll and runs until the stream is dropped.
    /// Each call starts a fresh scan. The same sensor shows up repeatedly.
    pub fn discover(&self) -> AdvertisementStream {
        let central = self.central.clone();
        let service = self.service;
        stream::once(async move { central.advertisements(service).await })
            .try_flatten()
            .boxed()
    }

    /// First advertisement from `identifier` within `timeout`
    pub async fn discover_identifier(
        &self,
        identifier: &Identifier,
        timeout: Duration,
    ) -> Result<Advertisement> {
        debug!("Looking for {} for up to {:?}", identifier, timeout);
        let search = async {
            let mut advertisements = self.discover();
            while let Some(advertisement) = advertisements.next().await {
                let advertisement = advertisement?;
                if advertisement.identifier == *identifier {
                    return Ok(advertisement);
                }
            }
            Err(HramError::DeviceNotConnected(format!(
                "scan ended before {} advertised",
                identifier
            )))
        };

        match tokio::time::timeout(timeout, search).await {
            Ok(result) => result,
            Err(_) => Err(HramError::ScanTimeout {
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCentral;

    #[tokio::test(start_paused = true)]
    async fn test_discover_lists_heart_rate_sensors() {
        let central = Arc::new(SimCentral::new());
        central.add_sensor("AA", Some("Strap A"));
        central.add_sensor("BB", Some("Strap B"));
        let scanner = Scanner::new(central.clone());

        let seen: Vec<_> = scanner
            .discover()
            .take(4)
            .map(|ad| ad.unwrap().identifier)
            .collect()
            .await;
        assert_eq!(seen.len(), 4);
        assert!(seen.contains(&Identifier::from("AA")));
        assert!(seen.contains(&Identifier::from("BB")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_is_lazy() {
        let central = Arc::new(SimCentral::new());
        let scanner = Scanner::new(central.clone());
        let stream = scanner.discover();
        assert_eq!(central.stats().scans(), 0);
        drop(stream);
        assert_eq!(central.stats().scans(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_identifier() {
        let central = Arc::new(SimCentral::new());
        central.add_sensor("AA", None);
        central.add_sensor("BB", Some("Target"));
        let scanner = Scanner::new(central.clone());

        let found = scanner
            .discover_identifier(&Identifier::from("BB"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found.name.as_deref(), Some("Target"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_identifier_times_out() {
        let central = Arc::new(SimCentral::new());
        central.add_sensor("AA", None);
        let scanner = Scanner::new(central.clone());

        let err = scanner
            .discover_identifier(&Identifier::from("ZZ"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HramError::ScanTimeout { duration_ms: 5000 }));
        assert!(err.is_reconnectable());
    }

    #[tokio::test]
    async fn test_scan_failure_propagates() {
        let central = Arc::new(SimCentral::new());
        central.fail_scans(Some("bluetooth permission denied"));
        let scanner = Scanner::new(central.clone());

        let err = scanner
            .discover_identifier(&Identifier::from("AA"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HramError::UnmetRequirement(_)));
    }
}
