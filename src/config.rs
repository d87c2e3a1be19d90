use std::time::Duration;

use envconfig::Envconfig;

/// Process settings read from the environment. Cluster policy lives in the
/// active `PaasConfig`, not here.
#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    #[envconfig(from = "PAAS_HTTP_ADDR", default = "0.0.0.0:8080")]
    pub http_addr: String,

    /// Field manager recorded on every write.
    #[envconfig(from = "PAAS_FIELD_MANAGER", default = "paas-operator")]
    pub field_manager: String,

    #[envconfig(nested)]
    pub reconcile: ReconcileConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ReconcileConfig {
    /// Objects of one kind reconciled at the same time.
    #[envconfig(from = "PAAS_CONCURRENCY", default = "4")]
    pub concurrency: u16,

    #[envconfig(from = "PAAS_RESYNC_SECS", default = "300")]
    pub resync_secs: u64,

    #[envconfig(from = "PAAS_ERROR_REQUEUE_SECS", default = "30")]
    pub error_requeue_secs: u64,

    #[envconfig(from = "PAAS_CONFLICT_REQUEUE_SECS", default = "2")]
    pub conflict_requeue_secs: u64,
}

impl ReconcileConfig {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_secs(self.conflict_requeue_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            resync_secs: 300,
            error_requeue_secs: 30,
            conflict_requeue_secs: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.field_manager, "paas-operator");
        assert_eq!(config.reconcile.concurrency, 4);
        assert_eq!(config.reconcile.resync(), Duration::from_secs(300));
        assert_eq!(config.reconcile.conflict_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("PAAS_CONCURRENCY".to_string(), "16".to_string()),
            ("PAAS_ERROR_REQUEUE_SECS".to_string(), "5".to_string()),
        ]);
        let config = OperatorConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(config.reconcile.concurrency, 16);
        assert_eq!(config.reconcile.error_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let env = HashMap::from([("PAAS_RESYNC_SECS".to_string(), "soon".to_string())]);
        assert!(OperatorConfig::init_from_hashmap(&env).is_err());
    }
}
