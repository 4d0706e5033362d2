use clap::Parser;
use common::ShutdownMessage;
use proxy::protocol::pop3::{Pop3Login, Pop3LoginSettings};
use proxy::server::engine::ProxyEngine;
use proxy::server::login_proxy::{ClientConn, LoginProxy};
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::server::{SslFlags, DIE_IDLE_SECS};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("PopProxy receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg =  format!("PopProxy receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy_config = ProxyServerArgs::parse();
    let log_level_string = proxy_config.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    if proxy_config.enable_metrics {
        common::metrics::init_metrics_context();
    }

    let works = proxy_config.works;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("POP_PROXY")
        .worker_threads(works)
        .build()?;

    info!("PopProxy running config args={:?}", proxy_config);
    runtime.block_on(async {
        let destination = proxy_config.resolve_destination().await?;
        let mechanism = proxy_config.sasl_mechanism().map_err(std::io::Error::other)?;
        let engine = ProxyEngine::new(proxy_config.engine_settings());
        let ssl_flags = proxy_config.ssl_flags();

        let port = proxy_config.port;
        let tcp_listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        info!("PopProxy listening on port {port}, backend {destination}");
        let conn_id = AtomicU64::new(0);
        loop {
            tokio::select! {
                shutdown_msg = shutdown_signal() => {
                    if let ShutdownMessage::Cancel(msg) = shutdown_msg {
                        info!("PopProxy process receive shutdown msg {msg}");
                    }
                    info!("PopProxy shutting down, closing idle sessions");
                    engine.kill_idle();
                    tokio::time::sleep(Duration::from_secs(DIE_IDLE_SECS)).await;
                    break;
                }
                rs = tcp_listener.accept() => {
                    match rs {
                        Ok((stream, peer_addr)) => {
                            let session_id = format!("s{}", conn_id.fetch_add(1, Ordering::Relaxed));
                            let local_addr = stream.local_addr().ok();
                            let (reader, writer) = stream.into_split();
                            let client = ClientConn {
                                reader,
                                writer,
                                virtual_user: proxy_config.proxy_user.clone(),
                                peer_addr,
                                local_addr,
                                service: "pop3".to_string(),
                                session_id: session_id.clone(),
                                alt_usernames: Vec::new(),
                                side_channel: None,
                            };
                            let driver = Pop3Login::new(Pop3LoginSettings {
                                user: proxy_config.proxy_user.clone(),
                                proxy_user: proxy_config.proxy_user.clone(),
                                master_user: proxy_config.master_user.clone(),
                                password: proxy_config.proxy_password.clone(),
                                mechanism,
                                require_starttls: ssl_flags.contains(SslFlags::STARTTLS),
                                session_id,
                                session_ttl: proxy_config.session_ttl,
                                local_name: proxy_config.local_name.clone(),
                                client_ip: peer_addr.ip(),
                                client_port: peer_addr.port(),
                                client_secured_tls: false,
                                client_trusted: proxy_config.forward_xclient,
                                passdb_fields: Vec::new(),
                            });
                            let session = LoginProxy::new(
                                engine.clone(),
                                client,
                                proxy_config.session_settings(destination.clone()),
                                driver,
                            );
                            tokio::spawn(async move {
                                let _ = session.run().await;
                            });
                        }
                        Err(e) => {
                            warn!("PopProxy accept connection err. cause by {e:?}");
                        }
                    }
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}
