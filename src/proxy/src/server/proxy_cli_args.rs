use crate::backend::Destination;
use crate::sasl::Mechanism;
use crate::server::engine::EngineSettings;
use crate::server::login_proxy::ProxySessionSettings;
use crate::server::SslFlags;

use clap::Parser;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "pop-proxy",
    version = "0.1.0",
    about = "authenticating login proxy for POP3 backends."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKS", default_value_t = 4)]
    pub works: usize,
    #[clap(long, value_name = "PORT", default_value_t = 1110)]
    pub port: u16,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
    #[clap(long, value_name = "ENABLE METRICS COLLECTOR", default_value_t = false)]
    pub enable_metrics: bool,

    /// Backend every accepted client is proxied to.
    #[clap(long, value_name = "HOST:PORT")]
    pub backend_addr: String,
    /// Login name sent to the backend for the (pre-identified) client.
    #[clap(long, value_name = "USER")]
    pub proxy_user: String,
    #[clap(long, value_name = "PASSWORD")]
    pub proxy_password: String,
    #[clap(long, value_name = "MASTER_USER")]
    pub master_user: Option<String>,
    /// SASL mechanism name; USER/PASS when not given.
    #[clap(long, value_name = "MECH")]
    pub mechanism: Option<String>,
    #[clap(long, value_name = "TTL", default_value_t = 5)]
    pub session_ttl: u32,
    #[clap(long, value_name = "DNS_NAME")]
    pub local_name: Option<String>,
    /// Treat clients as trusted and forward their identity via XCLIENT.
    #[clap(long, default_value_t = false)]
    pub forward_xclient: bool,

    #[clap(long, default_value_t = 3)]
    pub login_proxy_max_reconnects: u32,
    #[clap(long, value_name = "SECONDS", default_value_t = 0)]
    pub login_proxy_max_disconnect_delay: u64,
    #[clap(long, value_name = "PATH")]
    pub notify_path: Option<PathBuf>,
    #[clap(long, value_name = "PATH")]
    pub anvil_path: Option<PathBuf>,

    #[clap(long, value_name = "IP")]
    pub source_ip: Option<IpAddr>,
    #[clap(long, value_name = "MSECS", default_value_t = 30_000)]
    pub connect_timeout_msecs: u64,
    #[clap(long, value_name = "SECONDS", default_value_t = 0)]
    pub notify_refresh_secs: u64,
    #[clap(long, value_name = "SECONDS", default_value_t = 0)]
    pub host_immediate_failure_after_secs: u64,
    #[clap(long, default_value_t = false)]
    pub ssl: bool,
    #[clap(long, default_value_t = false)]
    pub starttls: bool,
    #[clap(long, default_value_t = false)]
    pub allow_invalid_cert: bool,
    #[clap(long, value_name = "DIR")]
    pub rawlog_dir: Option<PathBuf>,
}

impl ProxyServerArgs {
    pub fn ssl_flags(&self) -> SslFlags {
        let mut flags = SslFlags::empty();
        if self.ssl || self.starttls {
            flags |= SslFlags::YES;
        }
        if self.starttls {
            flags |= SslFlags::STARTTLS;
        }
        if self.allow_invalid_cert {
            flags |= SslFlags::ANY_CERT;
        }
        flags
    }

    pub fn sasl_mechanism(&self) -> Result<Option<Mechanism>, String> {
        match &self.mechanism {
            None => Ok(None),
            Some(name) => Mechanism::lookup(name)
                .map(Some)
                .ok_or_else(|| format!("unknown SASL mechanism: {name}")),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_reconnects: self.login_proxy_max_reconnects,
            max_disconnect_delay_secs: self.login_proxy_max_disconnect_delay,
            notify_path: self.notify_path.clone(),
            anvil_path: self.anvil_path.clone(),
        }
    }

    pub fn session_settings(&self, destination: Destination) -> ProxySessionSettings {
        ProxySessionSettings {
            destination,
            source_ip: self.source_ip,
            connect_timeout_msecs: self.connect_timeout_msecs,
            notify_refresh_secs: self.notify_refresh_secs,
            host_immediate_failure_after_secs: self.host_immediate_failure_after_secs,
            ssl_flags: self.ssl_flags(),
            local_name: self.local_name.clone(),
            rawlog_dir: self.rawlog_dir.clone(),
        }
    }

    pub async fn resolve_destination(&self) -> io::Result<Destination> {
        let (host, port) = self.backend_addr.rsplit_once(':').ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "backend_addr must be HOST:PORT",
            )
        })?;
        let port: u16 = port.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "backend_addr port is invalid")
        })?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Destination::new(host, ip, port));
        }
        let mut addrs = tokio::net::lookup_host((host, port)).await?;
        match addrs.next() {
            Some(addr) => Ok(Destination::new(host, addr.ip(), port)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {host}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "pop-proxy",
            "--backend-addr",
            "127.0.0.1:110",
            "--proxy-user",
            "alice",
            "--proxy-password",
            "s3cret",
        ]
    }

    #[test]
    fn test_ssl_flag_combinations() {
        let mut argv = base_args();
        argv.push("--starttls");
        argv.push("--allow-invalid-cert");
        let args = ProxyServerArgs::try_parse_from(argv).unwrap();
        let flags = args.ssl_flags();
        assert!(flags.contains(SslFlags::YES));
        assert!(flags.contains(SslFlags::STARTTLS));
        assert!(flags.contains(SslFlags::ANY_CERT));

        let args = ProxyServerArgs::try_parse_from(base_args()).unwrap();
        assert!(args.ssl_flags().is_empty());
    }

    #[test]
    fn test_mechanism_lookup() {
        let mut argv = base_args();
        argv.push("--mechanism");
        argv.push("plain");
        let args = ProxyServerArgs::try_parse_from(argv).unwrap();
        assert_eq!(args.sasl_mechanism().unwrap(), Some(Mechanism::Plain));

        let mut argv = base_args();
        argv.push("--mechanism");
        argv.push("scram-sha-256");
        let args = ProxyServerArgs::try_parse_from(argv).unwrap();
        assert!(args.sasl_mechanism().is_err());
    }

    #[tokio::test]
    async fn test_resolve_destination_ip_literal() {
        let args = ProxyServerArgs::try_parse_from(base_args()).unwrap();
        let destination = args.resolve_destination().await.unwrap();
        assert_eq!(destination.ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(destination.port, 110);
    }
}
