use super::ConnPicker;
use crate::connection::config::PoolConfig;
use crate::querier::Querier;
use crate::result::ScanApi;
use std::sync::Arc;

/// Construction options for a [`Cluster`](super::Cluster).
///
/// Absent overrides keep the defaults: reads go to `Cluster::replica` and rows
/// are scanned with [`ScanApi::default_api`].
#[derive(Clone, Default)]
pub struct ClusterOptions {
    pub(crate) picker: Option<ConnPicker>,
    pub(crate) scan_api: Option<Arc<ScanApi>>,
    pub(crate) pool: PoolConfig,
}

impl ClusterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `select`/`get` calls through `picker`.
    pub fn picker<F>(self, picker: F) -> Self
    where
        F: Fn(&super::Cluster, &str) -> Querier + Send + Sync + 'static,
    {
        self.with_picker(Some(Arc::new(picker)))
    }

    /// Sets the picker; `None` keeps the current one.
    pub fn with_picker(mut self, picker: Option<ConnPicker>) -> Self {
        if let Some(picker) = picker {
            self.picker = Some(picker);
        }
        self
    }

    pub fn scan_api(self, api: ScanApi) -> Self {
        self.with_scan_api(Some(Arc::new(api)))
    }

    /// Sets the scanner; `None` keeps the current one.
    pub fn with_scan_api(mut self, api: Option<Arc<ScanApi>>) -> Self {
        if let Some(api) = api {
            self.scan_api = Some(api);
        }
        self
    }

    /// Pool settings for every endpoint opened by [`Cluster::open`](super::Cluster::open).
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool
    }
}

impl std::fmt::Debug for ClusterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterOptions")
            .field("picker", &self.picker.is_some())
            .field("scan_api", &self.scan_api)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_overrides_keep_previous() {
        let options = ClusterOptions::new()
            .scan_api(ScanApi::new().column_separator("__"))
            .with_scan_api(None)
            .picker(|cluster, _| cluster.primary())
            .with_picker(None);

        assert!(options.picker.is_some());
        assert!(options.scan_api.is_some());
    }

    #[test]
    fn test_defaults() {
        let options = ClusterOptions::default();
        assert!(options.picker.is_none());
        assert!(options.scan_api.is_none());
        assert_eq!(options.pool_config().max_connections, 10);
    }
}
