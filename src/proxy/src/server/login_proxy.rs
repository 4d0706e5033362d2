use crate::backend::health::{AttemptOutcome, HealthRecord};
use crate::backend::Destination;
use crate::server::engine::{KillGrace, ProxyCommand, ProxyEngine};
use crate::server::pump::{run_pump, PumpStats};
use crate::server::rawlog::Rawlog;
use crate::server::stream::ServerStream;
use crate::server::{
    is_valid_dns_name, DialogStep, FailureKind, LoginDialog, LoginFailure, RedirectTarget,
    ServerOut, SideChannelVerdict, SslFlags, PROXY_CONNECT_RETRY_MSECS, PROXY_FAILURE_MSG,
    REDIRECT_LOOP_MIN,
};

use common::metrics::metric_def::{PROXY_LOGIN_FAILURES, PROXY_LOGIN_LATENCY, PROXY_RECONNECTS};
use common::metrics::{common_labels, counter_inc, MetricsTimer};
use nanoid::nanoid;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

const MAX_SERVER_LINE: u64 = 8192;

/// Per-session knobs; process-wide ones live on the engine.
#[derive(Debug, Clone)]
pub struct ProxySessionSettings {
    pub destination: Destination,
    pub source_ip: Option<IpAddr>,
    /// Budget for the whole pre-login including reconnects; 0 = no timer.
    pub connect_timeout_msecs: u64,
    pub notify_refresh_secs: u64,
    pub host_immediate_failure_after_secs: u64,
    pub ssl_flags: SslFlags,
    pub local_name: Option<String>,
    pub rawlog_dir: Option<PathBuf>,
}

/// The already-identified client whose session is being proxied.
pub struct ClientConn<R, W> {
    pub reader: R,
    pub writer: W,
    pub virtual_user: String,
    pub peer_addr: SocketAddr,
    /// The proxy-side address the client connected to; a redirect pointing
    /// back here is a loop.
    pub local_addr: Option<SocketAddr>,
    pub service: String,
    pub session_id: String,
    pub alt_usernames: Vec<String>,
    /// Pre-framed side-channel lines, when the transport provides one.
    pub side_channel: Option<mpsc::UnboundedReceiver<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEntry {
    pub ip: IpAddr,
    pub port: u16,
    pub count: u32,
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// Pre-login succeeded; the pump ran until one side closed.
    Detached {
        disconnect_reason: String,
        bytes_to_server: u64,
        bytes_to_client: u64,
    },
    Failed(LoginFailure),
    Killed(String),
}

enum PreLogin {
    Done {
        reader: BufReader<ServerStream>,
        client_reply: Option<String>,
        rawlog: Option<Rawlog>,
    },
    Failed(LoginFailure),
    Killed(String),
}

/// One proxied login session: connect with retry and fail-fast, drive the
/// pre-login dialog, then hand both sockets to the pump.
pub struct LoginProxy<R, W, D> {
    engine: Arc<ProxyEngine>,
    set: ProxySessionSettings,
    client: ClientConn<R, W>,
    driver: D,
    id: u64,
    created: Instant,
    reconnect_count: u32,
    redirect_path: Vec<RedirectEntry>,
    record: Option<Arc<HealthRecord>>,
    counted_waiting: bool,
    counted_active: bool,
    destroying: bool,
    delayed_disconnect: bool,
    reconnect_disabled: bool,
}

impl<R, W, D> LoginProxy<R, W, D>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    D: LoginDialog,
{
    pub fn new(
        engine: Arc<ProxyEngine>,
        client: ClientConn<R, W>,
        set: ProxySessionSettings,
        driver: D,
    ) -> Self {
        Self {
            engine,
            set,
            client,
            driver,
            id: 0,
            created: Instant::now(),
            reconnect_count: 0,
            redirect_path: Vec::new(),
            record: None,
            counted_waiting: false,
            counted_active: false,
            destroying: false,
            delayed_disconnect: false,
            reconnect_disabled: false,
        }
    }

    /// Forbid reconnects for this session regardless of budget.
    pub fn disable_reconnect(&mut self) {
        self.reconnect_disabled = true;
    }

    pub async fn run(mut self) -> SessionOutcome {
        let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
        self.id = self
            .engine
            .register_pending(&self.client.virtual_user, ctl_tx);
        let deadline = (self.set.connect_timeout_msecs > 0).then(|| {
            TokioInstant::from_std(self.created) + Duration::from_millis(self.set.connect_timeout_msecs)
        });
        let latency = MetricsTimer::new(PROXY_LOGIN_LATENCY);

        let prelogin = tokio::select! {
            r = self.login_loop(deadline) => match r {
                Ok((reader, client_reply, rawlog)) => PreLogin::Done { reader, client_reply, rawlog },
                Err(failure) => PreLogin::Failed(failure),
            },
            cmd = ctl_rx.recv() => match cmd {
                Some(ProxyCommand::Kill { reason, .. }) => PreLogin::Killed(reason),
                None => PreLogin::Killed("Control channel closed".to_string()),
            },
        };

        match prelogin {
            PreLogin::Done {
                reader,
                client_reply,
                rawlog,
            } => {
                drop(latency);
                self.detach_phase(reader, client_reply, rawlog, ctl_rx).await
            }
            PreLogin::Failed(failure) => {
                latency.discard();
                self.reply_failure(&failure).await;
                self.destroying = true;
                self.engine.remove(self.id);
                SessionOutcome::Failed(failure)
            }
            PreLogin::Killed(reason) => {
                // Kicked while still pending: the client is dropped without
                // a reply.
                latency.discard();
                self.destroying = true;
                self.release_record();
                self.engine.remove(self.id);
                SessionOutcome::Killed(reason)
            }
        }
    }

    async fn login_loop(
        &mut self,
        deadline: Option<TokioInstant>,
    ) -> Result<(BufReader<ServerStream>, Option<String>, Option<Rawlog>), LoginFailure> {
        loop {
            match self.connect_and_login(deadline).await {
                Ok(done) => return Ok(done),
                Err(failure) => {
                    self.release_record();
                    if failure.kind == FailureKind::AuthRedirect {
                        if let Some(target) = failure.redirect.clone() {
                            match self.apply_redirect(target).await {
                                Ok(()) => continue,
                                Err(redirect_failure) => {
                                    self.report_failure(&redirect_failure, false);
                                    return Err(redirect_failure);
                                }
                            }
                        }
                    }
                    let reconnecting = failure.kind.retryable() && self.try_reconnect(deadline);
                    self.report_failure(&failure, reconnecting);
                    if !reconnecting {
                        return Err(failure);
                    }
                    tokio::time::sleep(Duration::from_millis(PROXY_CONNECT_RETRY_MSECS)).await;
                }
            }
        }
    }

    async fn connect_and_login(
        &mut self,
        deadline: Option<TokioInstant>,
    ) -> Result<(BufReader<ServerStream>, Option<String>, Option<Rawlog>), LoginFailure> {
        self.driver.reset();
        if self.driver.hop_limit() <= 1 {
            return Err(LoginFailure::new(
                FailureKind::RemoteConfig,
                "TTL reached zero - loop?",
            ));
        }
        if let Some(name) = &self.set.local_name {
            if !is_valid_dns_name(name) {
                return Err(LoginFailure::new(
                    FailureKind::Internal,
                    "[BUG] Invalid local_name",
                ));
            }
        }
        let dest = self.set.destination.clone();
        if self.visit_count(dest.ip, dest.port) >= REDIRECT_LOOP_MIN {
            return Err(LoginFailure::new(
                FailureKind::InternalConfig,
                "Proxying loops",
            ));
        }

        let rec = self.engine.registry().get(dest.ip, dest.port);
        self.record = Some(rec.clone());
        rec.attempt_begin();
        self.counted_waiting = true;
        let window = Duration::from_secs(self.set.host_immediate_failure_after_secs);
        if rec.should_fail_fast(window) {
            rec.attempt_end(AttemptOutcome::Abandoned, self.created);
            self.counted_waiting = false;
            return Err(LoginFailure::new(
                FailureKind::Connect,
                format!("Host {dest} is down"),
            ));
        }

        let tcp = match self.tcp_connect(&dest, deadline).await {
            Ok(stream) => stream,
            Err(failure) => {
                rec.attempt_end(AttemptOutcome::Failure, self.created);
                self.counted_waiting = false;
                return Err(failure);
            }
        };
        rec.attempt_end(AttemptOutcome::Success, self.created);
        self.counted_waiting = false;
        self.counted_active = true;
        rec.reset_disconnect_batch();
        debug!(destination = %dest, "login proxy connected");

        let stream = if self.set.ssl_flags.contains(SslFlags::YES)
            && !self.set.ssl_flags.contains(SslFlags::STARTTLS)
        {
            self.start_tls(tcp).await?
        } else {
            ServerStream::Tcp(tcp)
        };

        let mut rawlog = match &self.set.rawlog_dir {
            Some(dir) => match Rawlog::open(dir, &self.client.session_id).await {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("rawlog open in {dir:?} failed: {e}");
                    None
                }
            },
            None => None,
        };

        let mut reader = BufReader::new(stream);
        loop {
            let line = read_server_line(&mut reader, deadline, &mut rawlog).await?;
            let mut out = ServerOut::new();
            let step = self.driver.on_server_line(&mut out, &line)?;
            flush_to_server(&mut reader, &mut out, &mut rawlog).await?;
            match step {
                DialogStep::Continue => {}
                DialogStep::StartTls => {
                    let tcp = match reader.into_inner() {
                        ServerStream::Tcp(tcp) => tcp,
                        #[cfg(feature = "tls")]
                        ServerStream::Tls(_) => {
                            return Err(LoginFailure::new(
                                FailureKind::Internal,
                                "STARTTLS requested on a TLS connection",
                            ));
                        }
                    };
                    let tls = self.start_tls(tcp).await?;
                    reader = BufReader::new(tls);
                    let mut out = ServerOut::new();
                    let step = self.driver.on_tls_established(&mut out)?;
                    flush_to_server(&mut reader, &mut out, &mut rawlog).await?;
                    if let DialogStep::Detach { client_reply } = step {
                        return Ok((reader, client_reply, rawlog));
                    }
                }
                DialogStep::Detach { client_reply } => {
                    return Ok((reader, client_reply, rawlog));
                }
            }
        }
    }

    async fn tcp_connect(
        &self,
        dest: &Destination,
        deadline: Option<TokioInstant>,
    ) -> Result<TcpStream, LoginFailure> {
        let socket = match dest.ip {
            IpAddr::V4(_) => TcpSocket::new_v4(),
            IpAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| LoginFailure::new(FailureKind::Internal, format!("socket() failed: {e}")))?;
        if let Some(source_ip) = self.set.source_ip {
            socket.bind(SocketAddr::new(source_ip, 0)).map_err(|e| {
                LoginFailure::new(
                    FailureKind::Connect,
                    format!("bind({source_ip}) failed: {e}"),
                )
            })?;
        }
        let connect = socket.connect(dest.addr());
        let connected = match deadline {
            Some(d) => tokio::time::timeout_at(d, connect)
                .await
                .map_err(|_| LoginFailure::new(FailureKind::Connect, "Connection timed out"))?,
            None => connect.await,
        };
        let stream = connected.map_err(|e| {
            LoginFailure::new(FailureKind::Connect, format!("connect({dest}) failed: {e}"))
        })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    #[cfg(feature = "tls")]
    async fn start_tls(&self, tcp: TcpStream) -> Result<ServerStream, LoginFailure> {
        use crate::server::stream::tls_connector;
        use tokio_rustls::rustls::pki_types::ServerName;

        let dest = &self.set.destination;
        let connector = tls_connector(self.set.ssl_flags);
        let server_name = ServerName::try_from(dest.host.clone())
            .unwrap_or_else(|_| ServerName::from(dest.ip));
        let tls = connector.connect(server_name, tcp).await.map_err(|e| {
            LoginFailure::new(
                FailureKind::Internal,
                format!("TLS handshake to {dest} failed: {e}"),
            )
        })?;
        Ok(ServerStream::Tls(Box::new(tls)))
    }

    #[cfg(not(feature = "tls"))]
    async fn start_tls(&self, _tcp: TcpStream) -> Result<ServerStream, LoginFailure> {
        Err(LoginFailure::new(
            FailureKind::Internal,
            "TLS support not compiled in",
        ))
    }

    fn visit_count(&self, ip: IpAddr, port: u16) -> u32 {
        self.redirect_path
            .iter()
            .find(|entry| entry.ip == ip && entry.port == port)
            .map_or(0, |entry| entry.count)
    }

    async fn apply_redirect(&mut self, target: RedirectTarget) -> Result<(), LoginFailure> {
        let port = target.port.unwrap_or(self.set.destination.port);
        let ip = match target.host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                let mut addrs = tokio::net::lookup_host((target.host.as_str(), port))
                    .await
                    .map_err(|e| {
                        LoginFailure::new(
                            FailureKind::RemoteConfig,
                            format!("Redirect to unresolvable host {}: {e}", target.host),
                        )
                    })?;
                match addrs.next() {
                    Some(addr) => addr.ip(),
                    None => {
                        return Err(LoginFailure::new(
                            FailureKind::RemoteConfig,
                            format!("Redirect to unresolvable host {}", target.host),
                        ));
                    }
                }
            }
        };

        if let Some(local) = self.client.local_addr {
            if local.ip() == ip && local.port() == port {
                return Err(LoginFailure::new(
                    FailureKind::InternalConfig,
                    "Proxying loops",
                ));
            }
        }
        if self.visit_count(ip, port) >= REDIRECT_LOOP_MIN {
            return Err(LoginFailure::new(
                FailureKind::InternalConfig,
                "Proxying loops",
            ));
        }

        self.driver.on_redirect(&target);
        match self
            .redirect_path
            .iter_mut()
            .find(|entry| entry.ip == ip && entry.port == port)
        {
            Some(entry) => entry.count += 1,
            None => self.redirect_path.push(RedirectEntry { ip, port, count: 1 }),
        }
        info!(
            user = %self.client.virtual_user,
            from = %self.set.destination,
            to = %target,
            "proxy redirect"
        );
        self.set.destination = Destination::new(target.host.clone(), ip, port);
        self.record = None;
        Ok(())
    }

    fn try_reconnect(&mut self, deadline: Option<TokioInstant>) -> bool {
        if self.reconnect_disabled {
            return false;
        }
        if self.reconnect_count >= self.engine.settings().max_reconnects {
            return false;
        }
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(TokioInstant::now());
            if remaining < Duration::from_millis(PROXY_CONNECT_RETRY_MSECS + 100) {
                return false;
            }
        }
        self.reconnect_count += 1;
        counter_inc(PROXY_RECONNECTS, 1, Some(common_labels()));
        true
    }

    fn report_failure(&self, failure: &LoginFailure, reconnecting: bool) {
        if self.destroying {
            return;
        }
        warn!(
            user = %self.client.virtual_user,
            destination = %self.set.destination,
            error = %failure.reason,
            error_code = %failure.kind,
            reconnect_attempts = self.reconnect_count,
            reconnecting,
            "login proxy failure"
        );
        let labels = vec![("reason", failure.kind.to_string())];
        counter_inc(PROXY_LOGIN_FAILURES, 1, Some(&labels));
    }

    /// Final failure: pick the reply the dialog chose, or the generic
    /// proxy-failure reply.
    async fn reply_failure(&mut self, failure: &LoginFailure) {
        let reply = failure
            .client_reply
            .clone()
            .unwrap_or_else(|| format!("-ERR {PROXY_FAILURE_MSG}"));
        let _ = self
            .client
            .writer
            .write_all(format!("{reply}\r\n").as_bytes())
            .await;
        let _ = self.client.writer.flush().await;
    }

    fn release_record(&mut self) {
        if let Some(rec) = &self.record {
            if self.counted_waiting {
                // The attempt was cancelled before the socket reported.
                rec.attempt_end(AttemptOutcome::Abandoned, self.created);
                self.counted_waiting = false;
            }
            if self.counted_active {
                rec.active_end();
                self.counted_active = false;
            }
            if self.delayed_disconnect {
                rec.delayed_disconnect_done();
                self.delayed_disconnect = false;
            }
        }
    }

    async fn detach_phase(
        mut self,
        reader: BufReader<ServerStream>,
        client_reply: Option<String>,
        mut rawlog: Option<Rawlog>,
        mut ctl_rx: mpsc::UnboundedReceiver<ProxyCommand>,
    ) -> SessionOutcome {
        if let Some(reply) = &client_reply {
            if self
                .client
                .writer
                .write_all(format!("{reply}\r\n").as_bytes())
                .await
                .is_err()
            {
                let failure =
                    LoginFailure::new(FailureKind::Internal, "Client disconnected at login");
                self.destroying = true;
                self.release_record();
                self.engine.remove(self.id);
                return SessionOutcome::Failed(failure);
            }
        }

        let stats = Arc::new(PumpStats::new());
        let anvil_guid = match self.engine.anvil() {
            Some(anvil) => {
                let guid = nanoid!();
                anvil
                    .report_connect(
                        &guid,
                        &self.client.virtual_user,
                        &self.client.service,
                        &self.client.peer_addr.to_string(),
                        &self.set.destination.addr().to_string(),
                        &self.client.alt_usernames,
                    )
                    .await;
                Some(guid)
            }
            None => None,
        };
        self.engine.promote(self.id, stats.clone(), anvil_guid.clone());
        info!(
            user = %self.client.virtual_user,
            destination = %self.set.destination,
            reconnects = self.reconnect_count,
            "proxy detached"
        );

        let notify_task = if self.set.notify_refresh_secs > 0 {
            let engine = self.engine.clone();
            let user = self.client.virtual_user.clone();
            let period = Duration::from_secs(self.set.notify_refresh_secs);
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    engine.notify_user(&user).await;
                }
            }))
        } else {
            None
        };

        let (mut server_read, mut server_write) = tokio::io::split(reader);
        let mut side_rx = self.client.side_channel.take();
        let mut kill: Option<(String, TokioInstant)> = None;
        let mut ctl_open = true;

        let end = {
            let pump = run_pump(
                &mut self.client.reader,
                &mut self.client.writer,
                &mut server_read,
                &mut server_write,
                &stats,
                rawlog.as_mut(),
            );
            tokio::pin!(pump);
            loop {
                tokio::select! {
                    end = &mut pump => break Ok(end),
                    cmd = ctl_rx.recv(), if ctl_open => match cmd {
                        Some(ProxyCommand::Kill { reason, grace }) => match grace {
                            KillGrace::Now => break Err(reason),
                            KillGrace::After(delay) => {
                                kill = Some((reason, TokioInstant::now() + delay));
                            }
                            KillGrace::Paced => {
                                let delay = match &self.record {
                                    Some(rec) => rec.delay_disconnect(
                                        self.engine.settings().max_disconnect_delay_secs,
                                    ),
                                    None => Duration::ZERO,
                                };
                                if delay.is_zero() {
                                    break Err(reason);
                                }
                                self.delayed_disconnect = true;
                                kill = Some((reason, TokioInstant::now() + delay));
                            }
                        },
                        None => ctl_open = false,
                    },
                    _ = async {
                        match &kill {
                            Some((_, at)) => tokio::time::sleep_until(*at).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        if let Some((reason, _)) = kill.take() {
                            break Err(reason);
                        }
                    }
                    msg = async {
                        match side_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => match msg {
                        Some(line) => {
                            let args: Vec<&str> = line.split('\t').collect();
                            if let SideChannelVerdict::Disconnect(reason) =
                                self.driver.on_side_channel(&args)
                            {
                                break Err(reason);
                            }
                        }
                        None => side_rx = None,
                    },
                }
            }
        };

        if let Some(task) = notify_task {
            task.abort();
        }
        self.destroying = true;

        let bytes_to_server = stats
            .bytes_to_server
            .load(std::sync::atomic::Ordering::Acquire);
        let bytes_to_client = stats
            .bytes_to_client
            .load(std::sync::atomic::Ordering::Acquire);
        let blocked = if stats.client_output_blocked() {
            ", client output blocked"
        } else if stats.server_output_blocked() {
            ", server output blocked"
        } else {
            ""
        };
        let (reason, killed) = match end {
            Ok(pump_end) => (pump_end.describe(), false),
            Err(kill_reason) => (kill_reason, true),
        };
        let disconnect_reason = format!(
            "{reason} ({}s idle, in={bytes_to_server}, out={bytes_to_client}{blocked})",
            stats.idle_secs()
        );
        info!(
            user = %self.client.virtual_user,
            destination = %self.set.destination,
            bytes_in = bytes_to_server,
            bytes_out = bytes_to_client,
            idle_secs = stats.idle_secs(),
            "proxy session finished: {disconnect_reason}"
        );

        self.release_record();
        self.engine.remove(self.id);
        if let (Some(anvil), Some(guid)) = (self.engine.anvil(), &anvil_guid) {
            anvil
                .report_disconnect(guid, &self.client.virtual_user, &self.client.service)
                .await;
        }

        if killed {
            SessionOutcome::Killed(disconnect_reason)
        } else {
            SessionOutcome::Detached {
                disconnect_reason,
                bytes_to_server,
                bytes_to_client,
            }
        }
    }
}

async fn read_server_line(
    reader: &mut BufReader<ServerStream>,
    deadline: Option<TokioInstant>,
    rawlog: &mut Option<Rawlog>,
) -> Result<String, LoginFailure> {
    let mut buf = Vec::new();
    let read = async {
        (&mut *reader)
            .take(MAX_SERVER_LINE)
            .read_until(b'\n', &mut buf)
            .await
    };
    let n = match deadline {
        Some(d) => tokio::time::timeout_at(d, read)
            .await
            .map_err(|_| LoginFailure::new(FailureKind::Connect, "Login timed out"))?,
        None => read.await,
    }
    .map_err(|e| {
        LoginFailure::new(FailureKind::Remote, format!("read from server failed: {e}"))
    })?;
    if n == 0 {
        return Err(LoginFailure::new(
            FailureKind::Remote,
            "Server disconnected unexpectedly",
        ));
    }
    if let Some(log) = rawlog.as_mut() {
        log.write_in(&buf).await;
    }
    if !buf.ends_with(b"\n") {
        return Err(LoginFailure::new(
            FailureKind::Protocol,
            "Server sent too long a line",
        ));
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn flush_to_server(
    reader: &mut BufReader<ServerStream>,
    out: &mut ServerOut,
    rawlog: &mut Option<Rawlog>,
) -> Result<(), LoginFailure> {
    if out.is_empty() {
        return Ok(());
    }
    let bytes = out.take();
    if let Some(log) = rawlog.as_mut() {
        log.write_out(&bytes).await;
    }
    let stream = reader.get_mut();
    stream.write_all(&bytes).await.map_err(|e| {
        LoginFailure::new(FailureKind::Remote, format!("write to server failed: {e}"))
    })?;
    stream.flush().await.map_err(|e| {
        LoginFailure::new(FailureKind::Remote, format!("write to server failed: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pop3::{Pop3Login, Pop3LoginSettings};
    use crate::server::engine::EngineSettings;
    use crate::server::KILL_PREFIX;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::net::TcpListener;

    type TestClient = ClientConn<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn test_client(user: &str) -> (TestClient, DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(near);
        let client = ClientConn {
            reader,
            writer,
            virtual_user: user.to_string(),
            peer_addr: "192.0.2.7:51234".parse().unwrap(),
            local_addr: None,
            service: "pop3".to_string(),
            session_id: "s1".to_string(),
            alt_usernames: Vec::new(),
            side_channel: None,
        };
        (client, far)
    }

    fn session_settings(addr: SocketAddr) -> ProxySessionSettings {
        ProxySessionSettings {
            destination: Destination::new(addr.ip().to_string(), addr.ip(), addr.port()),
            source_ip: None,
            connect_timeout_msecs: 5_000,
            notify_refresh_secs: 0,
            host_immediate_failure_after_secs: 0,
            ssl_flags: SslFlags::empty(),
            local_name: None,
            rawlog_dir: None,
        }
    }

    fn untrusted_driver() -> Pop3Login {
        Pop3Login::new(Pop3LoginSettings {
            client_trusted: false,
            ..Pop3LoginSettings::for_tests()
        })
    }

    async fn expect_line(stream: &mut BufReader<tokio::net::TcpStream>, expected: &str) {
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        assert_eq!(line, format!("{expected}\r\n"));
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_plaintext_user_pass_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            stream.get_mut().write_all(b"+OK ready\r\n").await.unwrap();
            expect_line(&mut stream, "USER alice").await;
            stream.get_mut().write_all(b"+OK\r\n").await.unwrap();
            expect_line(&mut stream, "PASS s3cret").await;
            stream
                .get_mut()
                .write_all(b"+OK logged in\r\n")
                .await
                .unwrap();
            // Absorb forwarded client bytes until EOF.
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
            assert_eq!(sink, b"QUIT\r\n");
        });

        let engine = ProxyEngine::new(EngineSettings::default());
        let (client, mut client_far) = test_client("alice");
        let proxy = LoginProxy::new(
            engine.clone(),
            client,
            session_settings(addr),
            untrusted_driver(),
        );
        let session = tokio::spawn(proxy.run());

        let mut reply = [0u8; 64];
        let n = client_far.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"+OK logged in\r\n");
        wait_for(|| engine.detached_count() == 1).await;
        assert_eq!(engine.registry().get(addr.ip(), addr.port()).active_count(), 1);

        client_far.write_all(b"QUIT\r\n").await.unwrap();
        drop(client_far);

        match session.await.unwrap() {
            SessionOutcome::Detached {
                disconnect_reason,
                bytes_to_server,
                ..
            } => {
                assert!(disconnect_reason.starts_with("Disconnected by client"));
                assert_eq!(bytes_to_server, 6);
            }
            other => panic!("expected detached outcome, got {other:?}"),
        }
        assert_eq!(engine.detached_count(), 0);
        assert_eq!(engine.registry().get(addr.ip(), addr.port()).active_count(), 0);
    }

    #[tokio::test]
    async fn test_tempfail_is_forwarded_and_not_retried_with_zero_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let backend_accepts = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                backend_accepts.fetch_add(1, Ordering::SeqCst);
                let mut stream = BufReader::new(stream);
                stream.get_mut().write_all(b"+OK ready\r\n").await.unwrap();
                expect_line(&mut stream, "USER alice").await;
                stream.get_mut().write_all(b"+OK\r\n").await.unwrap();
                expect_line(&mut stream, "PASS s3cret").await;
                stream
                    .get_mut()
                    .write_all(b"-ERR [SYS/TEMP] DB down\r\n")
                    .await
                    .unwrap();
            }
        });

        let engine = ProxyEngine::new(EngineSettings {
            max_reconnects: 0,
            ..EngineSettings::default()
        });
        let (client, mut client_far) = test_client("alice");
        let proxy = LoginProxy::new(
            engine.clone(),
            client,
            session_settings(addr),
            untrusted_driver(),
        );
        let outcome = proxy.run().await;

        match outcome {
            SessionOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::AuthTempfail);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let mut reply = [0u8; 64];
        let n = client_far.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"-ERR [SYS/TEMP] DB down\r\n");
        // max_reconnects = 0: exactly one attempt.
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_reconnects_within_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let backend_accepts = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                backend_accepts.fetch_add(1, Ordering::SeqCst);
                // Not a POP3 banner: a Protocol failure, which is retryable.
                let _ = stream.write_all(b"220 smtp.example.com\r\n").await;
            }
        });

        let engine = ProxyEngine::new(EngineSettings {
            max_reconnects: 1,
            ..EngineSettings::default()
        });
        let (client, _client_far) = test_client("alice");
        let mut settings = session_settings(addr);
        settings.connect_timeout_msecs = 0;
        let proxy = LoginProxy::new(engine.clone(), client, settings, untrusted_driver());
        let outcome = proxy.run().await;

        match outcome {
            SessionOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::Protocol);
                assert_eq!(failure.reason, "Invalid banner");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_short_budget_blocks_retry() {
        // Nothing listens here; connects are refused immediately.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let engine = ProxyEngine::new(EngineSettings::default());
        let (client, _client_far) = test_client("alice");
        let mut settings = session_settings(addr);
        // Less than PROXY_CONNECT_RETRY_MSECS + 100 of budget: no retry.
        settings.connect_timeout_msecs = 300;
        let started = Instant::now();
        let proxy = LoginProxy::new(engine.clone(), client, settings, untrusted_driver());
        let outcome = proxy.run().await;

        match outcome {
            SessionOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::Connect),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_redirect_loop_detection() {
        // Backend A redirects to B, then to itself; B redirects back to A.
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        tokio::spawn(async move {
            let mut visits = 0;
            loop {
                let (stream, _) = listener_a.accept().await.unwrap();
                visits += 1;
                let target = if visits == 1 { addr_b } else { addr_a };
                let mut stream = BufReader::new(stream);
                stream.get_mut().write_all(b"+OK ready\r\n").await.unwrap();
                expect_line(&mut stream, "USER alice").await;
                let referral = format!("-ERR [REFERRAL/{}:{}]\r\n", target.ip(), target.port());
                stream
                    .get_mut()
                    .write_all(referral.as_bytes())
                    .await
                    .unwrap();
            }
        });
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener_b.accept().await.unwrap();
                let mut stream = BufReader::new(stream);
                stream.get_mut().write_all(b"+OK ready\r\n").await.unwrap();
                expect_line(&mut stream, "USER alice").await;
                let referral = format!("-ERR [REFERRAL/{}:{}]\r\n", addr_a.ip(), addr_a.port());
                stream
                    .get_mut()
                    .write_all(referral.as_bytes())
                    .await
                    .unwrap();
            }
        });

        let engine = ProxyEngine::new(EngineSettings::default());
        let (client, _client_far) = test_client("alice");
        let proxy = LoginProxy::new(
            engine.clone(),
            client,
            session_settings(addr_a),
            untrusted_driver(),
        );
        let outcome = proxy.run().await;

        match outcome {
            SessionOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::InternalConfig);
                assert_eq!(failure.reason, "Proxying loops");
            }
            other => panic!("expected loop failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_kick_user_closes_detached_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            stream.get_mut().write_all(b"+OK ready\r\n").await.unwrap();
            expect_line(&mut stream, "USER alice").await;
            stream.get_mut().write_all(b"+OK\r\n").await.unwrap();
            expect_line(&mut stream, "PASS s3cret").await;
            stream
                .get_mut()
                .write_all(b"+OK logged in\r\n")
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let engine = ProxyEngine::new(EngineSettings::default());
        let (client, mut client_far) = test_client("alice");
        let proxy = LoginProxy::new(
            engine.clone(),
            client,
            session_settings(addr),
            untrusted_driver(),
        );
        let session = tokio::spawn(proxy.run());

        let mut reply = [0u8; 64];
        let n = client_far.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"+OK logged in\r\n");
        wait_for(|| engine.detached_count() == 1).await;

        assert_eq!(engine.kick_user("alice", None), 1);
        match session.await.unwrap() {
            SessionOutcome::Killed(reason) => {
                assert!(reason.contains(&format!("{KILL_PREFIX}Kicked by admin")));
            }
            other => panic!("expected kill, got {other:?}"),
        }
        assert_eq!(engine.detached_count(), 0);
    }

    #[tokio::test]
    async fn test_kick_user_sweeps_pending_sessions() {
        // A backend that never finishes the dialog keeps the proxy pending.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Say nothing; hold the socket open.
            std::mem::forget(stream);
        });

        let engine = ProxyEngine::new(EngineSettings::default());
        let (client, _client_far) = test_client("alice");
        let proxy = LoginProxy::new(
            engine.clone(),
            client,
            session_settings(addr),
            untrusted_driver(),
        );
        let session = tokio::spawn(proxy.run());

        // Wait for the session to register as pending.
        wait_for(|| engine.pending_count() == 1).await;
        assert_eq!(engine.kick_user("alice", None), 1);
        match session.await.unwrap() {
            SessionOutcome::Killed(reason) => {
                assert!(reason.contains("Kicked by admin"));
            }
            other => panic!("expected kill, got {other:?}"),
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_idle_closes_detached_session_now() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            stream.get_mut().write_all(b"+OK ready\r\n").await.unwrap();
            expect_line(&mut stream, "USER alice").await;
            stream.get_mut().write_all(b"+OK\r\n").await.unwrap();
            expect_line(&mut stream, "PASS s3cret").await;
            stream
                .get_mut()
                .write_all(b"+OK logged in\r\n")
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let engine = ProxyEngine::new(EngineSettings::default());
        let (client, mut client_far) = test_client("alice");
        let proxy = LoginProxy::new(
            engine.clone(),
            client,
            session_settings(addr),
            untrusted_driver(),
        );
        let session = tokio::spawn(proxy.run());

        let mut reply = [0u8; 64];
        let _ = client_far.read(&mut reply).await.unwrap();
        wait_for(|| engine.detached_count() == 1).await;

        // The session just detached, so it gets the grace timer; the close
        // still lands within DIE_IDLE_SECS.
        engine.kill_idle();
        match session.await.unwrap() {
            SessionOutcome::Killed(reason) => {
                assert!(reason.contains("Process shutting down"));
            }
            other => panic!("expected kill, got {other:?}"),
        }
    }
}

