pub const PROXY_PENDING_CONN: &str = "login_proxy_pending_connections";
pub const PROXY_DETACHED_CONN: &str = "login_proxy_detached_connections";
pub const PROXY_LOGIN_FAILURES: &str = "login_proxy_login_failures_total";
pub const PROXY_RECONNECTS: &str = "login_proxy_reconnects_total";
pub const PROXY_LOGIN_LATENCY: &str = "login_proxy_prelogin_latency";

#[macro_export]
macro_rules! metrics_const {
    ($({$metric_name:ident, $init_fn:ident, $metric_type:expr, $name:expr, $desc:expr}),*) => {
        use metrics::KeyName;
        use std::sync::OnceLock;
        use $crate::metrics::MetricType;

        #[derive(Debug, Clone)]
        pub enum MetricsConsts {
           $($metric_name(&'static str, &'static str, KeyName, MetricType),)*
        }

        pub fn list_all_metrics() -> &'static Vec<MetricsConsts> {
           static ALL_METRICS: OnceLock<Vec<MetricsConsts>> = OnceLock::new();
           ALL_METRICS.get_or_init(|| {
              vec![$(MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type),)*]
           })
        }

        impl MetricsConsts {
            $(
            #[inline]
            pub fn $init_fn() -> Self {
                MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type)
            })*

            pub fn get_name(&self) -> String {
                let (name, _,_,_) = self.get_metrics_pair();
                name.to_string()
            }

            pub fn get_metrics_pair(&self) -> (&'static str, &'static str, &KeyName, &MetricType){
                match self {
                    $(
                    MetricsConsts::$metric_name(name, desc, key_name, metrics_type) => (name, desc, key_name, metrics_type),
                    )*
                }
            }
        }
    };
}

metrics_const!(
    { ProxyPendingConnections, pending_connections, MetricType::Gauge, PROXY_PENDING_CONN, "Proxies that have not finished the pre-login dialog."},
    { ProxyDetachedConnections, detached_connections, MetricType::Gauge, PROXY_DETACHED_CONN, "Proxies handed over to the byte pump."},
    { ProxyLoginFailures, login_failures, MetricType::Counter, PROXY_LOGIN_FAILURES, "Pre-login failures by failure kind."},
    { ProxyReconnects, reconnects, MetricType::Counter, PROXY_RECONNECTS, "Reconnect attempts against a destination."},
    { ProxyLoginLatency, prelogin_latency, MetricType::Histogram, PROXY_LOGIN_LATENCY, "Latency of the pre-login dialog in milliseconds."}
);
