use super::{LogTrail, TlsRequirement, tls_client_config};
use crate::{
    classify::{DeliveryError, Protocol},
    delivery::{Credentials, SourceAddress},
    dns::ResolvedMx,
};
use base64ct::{Base64, Encoding};
use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    sync::Mutex,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    time::timeout,
};
use tokio_rustls::{TlsConnector, client::TlsStream, rustls::pki_types::ServerName};
use tracing::{debug, trace, warn};

/// Grace period after an unexpected EOF on a healthy write path before the
/// close is treated as a real failure.
const EOF_GRACE: Duration = Duration::from_secs(1);

/// Capabilities advertised in the EHLO/LHLO response.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub starttls: bool,
    pub pipelining: bool,
    pub auth_plain: bool,
    pub auth_login: bool,
    pub size: Option<u64>,
    pub eight_bit_mime: bool,
    pub smtputf8: bool,
}

impl Capabilities {
    fn parse(reply: &Reply) -> Self {
        let mut caps = Self::default();
        for line in reply.lines.iter().skip(1) {
            // the legacy AUTH=PLAIN form still shows up in the wild
            let keyword = line.get(4..).unwrap_or_default().trim().replace("AUTH=", "AUTH ");
            let mut words = keyword.split_whitespace();
            match words.next().unwrap_or_default().to_ascii_uppercase().as_str() {
                "STARTTLS" => caps.starttls = true,
                "PIPELINING" => caps.pipelining = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "SMTPUTF8" => caps.smtputf8 = true,
                "SIZE" => caps.size = words.next().and_then(|s| s.parse().ok()).or(Some(0)),
                "AUTH" => {
                    for mech in words {
                        match mech.to_ascii_uppercase().as_str() {
                            "PLAIN" => caps.auth_plain = true,
                            "LOGIN" => caps.auth_login = true,
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        caps
    }
}

/// One parsed (possibly multi-line) server reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }
}

#[derive(Debug)]
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Detached,
}

impl Stream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf).await,
            Stream::Tls(s) => s.read(buf).await,
            Stream::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.write_all(bytes).await,
            Stream::Tls(s) => s.write_all(bytes).await,
            Stream::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush().await,
            Stream::Tls(s) => s.flush().await,
            Stream::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Stream::Plain(s) => s.shutdown().await,
            Stream::Tls(s) => s.shutdown().await,
            Stream::Detached => Ok(()),
        };
    }
}

/// Where and how a live session is connected.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub exchange: String,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub ehlo_name: String,
    pub tls: bool,
    pub auth: bool,
    pub lmtp: bool,
}

/// An established SMTP/LMTP session, positioned at the MAIL state.
#[derive(Debug)]
pub struct SmtpConnection {
    stream: Stream,
    read_buf: Vec<u8>,
    pub trail: LogTrail,
    pub info: ConnectionInfo,
    pub caps: Capabilities,
    command_timeout: Duration,
    usage_count: u32,
    last_ok: bool,
    rcpt_accepted: usize,
    /// Last two body bytes written, to close DATA with exactly one CRLF.
    data_tail: [u8; 2],
    data_at_line_start: bool,
}

impl SmtpConnection {
    fn protocol(&self) -> Protocol {
        if self.info.lmtp {
            Protocol::Lmtp
        } else {
            Protocol::Smtp
        }
    }

    fn fail(&self, err: DeliveryError) -> DeliveryError {
        err.with_trail(self.trail.snapshot())
    }

    fn reply_error(&self, reply: &Reply) -> DeliveryError {
        self.fail(DeliveryError::smtp(reply.text(), self.protocol()))
    }

    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.read_buf.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.read_buf.drain(..=pos).collect();
                while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read one complete reply, enforcing the per-command timeout.
    async fn read_reply(&mut self, command: &str) -> Result<Reply, DeliveryError> {
        let mut lines: Vec<String> = Vec::new();
        loop {
            let line = match timeout(self.command_timeout, self.read_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    return Err(self.fail(DeliveryError::network(format!(
                        "connection closed while waiting for {command} response"
                    ))));
                }
                Ok(Err(err)) => {
                    return Err(self.fail(DeliveryError::network(format!(
                        "read failed while waiting for {command} response: {err}"
                    ))));
                }
                Err(_) => {
                    return Err(self.fail(DeliveryError::network(format!(
                        "timeout waiting for {command} response"
                    ))));
                }
            };
            self.trail.received(&line);
            let done = line.len() < 4 || line.as_bytes()[3] != b'-';
            lines.push(line);
            if done {
                break;
            }
        }

        let code = lines
            .first()
            .and_then(|line| line.get(..3))
            .and_then(|digits| digits.parse::<u16>().ok())
            .unwrap_or(0);
        Ok(Reply { code, lines })
    }

    /// Like `read_reply`, but tolerant of a spurious EOF: waits out a short
    /// grace period and looks again before declaring the close real.
    async fn read_reply_graceful(&mut self, command: &str) -> Result<Reply, DeliveryError> {
        match self.read_reply(command).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.response.contains("connection closed") => {
                tokio::time::sleep(EOF_GRACE).await;
                self.read_reply(command).await
            }
            Err(err) => Err(err),
        }
    }

    async fn command(&mut self, line: &str) -> Result<Reply, DeliveryError> {
        self.trail.sent(line);
        trace!(exchange = self.info.exchange, "C: {line}");
        let framed = format!("{line}\r\n");
        if let Err(err) = self.stream.write_all(framed.as_bytes()).await {
            self.last_ok = false;
            return Err(self.fail(DeliveryError::network(format!(
                "write failed: {err}"
            ))));
        }
        if let Err(err) = self.stream.flush().await {
            self.last_ok = false;
            return Err(self.fail(DeliveryError::network(format!(
                "write failed: {err}"
            ))));
        }
        let verb = line.split_whitespace().next().unwrap_or(line).to_string();
        self.read_reply(&verb).await
    }

    /// `MAIL FROM`, announcing SIZE when the server supports it. Resets
    /// per-message state so a pooled session starts clean.
    pub async fn mail_from(&mut self, from: &str, size_hint: u64) -> Result<(), DeliveryError> {
        self.rcpt_accepted = 0;
        self.data_tail = [b'\r', b'\n'];
        self.data_at_line_start = true;

        let mut line = format!("MAIL FROM:<{from}>");
        if self.caps.size.is_some() && size_hint > 0 {
            line.push_str(&format!(" SIZE={size_hint}"));
        }
        let reply = self.command(&line).await?;
        if !reply.is_positive() {
            self.last_ok = false;
            return Err(self.reply_error(&reply));
        }
        Ok(())
    }

    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<(), DeliveryError> {
        let reply = self.command(&format!("RCPT TO:<{recipient}>")).await?;
        if !reply.is_positive() {
            self.last_ok = false;
            return Err(self.reply_error(&reply));
        }
        self.rcpt_accepted += 1;
        Ok(())
    }

    pub async fn data_start(&mut self) -> Result<(), DeliveryError> {
        let reply = self.command("DATA").await?;
        if reply.code != 354 {
            self.last_ok = false;
            return Err(self.reply_error(&reply));
        }
        Ok(())
    }

    /// Stream one chunk of message content into the DATA channel with
    /// dot-stuffing applied at line starts.
    pub async fn write_body_chunk(&mut self, chunk: &[u8]) -> Result<(), DeliveryError> {
        let mut out = Vec::with_capacity(chunk.len() + 16);
        for &byte in chunk {
            if self.data_at_line_start && byte == b'.' {
                out.push(b'.');
            }
            out.push(byte);
            self.data_at_line_start = byte == b'\n';
            self.data_tail = [self.data_tail[1], byte];
        }
        self.stream.write_all(&out).await.map_err(|err| {
            self.last_ok = false;
            DeliveryError::network(format!("body write failed: {err}"))
                .with_trail(self.trail.snapshot())
        })
    }

    /// Terminate DATA and collect the server verdict. LMTP sessions answer
    /// once per accepted recipient; any rejected recipient fails the
    /// delivery with the server's own words.
    pub async fn finish_data(&mut self) -> Result<Reply, DeliveryError> {
        let terminator: &[u8] = if self.data_tail == [b'\r', b'\n'] {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        };
        self.trail.sent(".");
        if let Err(err) = self.stream.write_all(terminator).await {
            self.last_ok = false;
            return Err(self.fail(DeliveryError::network(format!(
                "body terminator write failed: {err}"
            ))));
        }
        if let Err(err) = self.stream.flush().await {
            self.last_ok = false;
            return Err(self.fail(DeliveryError::network(format!(
                "body terminator write failed: {err}"
            ))));
        }

        let replies = if self.info.lmtp {
            self.rcpt_accepted.max(1)
        } else {
            1
        };
        let mut last = None;
        for _ in 0..replies {
            let reply = self.read_reply_graceful("end-of-data").await?;
            if !reply.is_positive() {
                self.last_ok = false;
                return Err(self.reply_error(&reply));
            }
            last = Some(reply);
        }

        self.usage_count += 1;
        self.last_ok = true;
        Ok(last.expect("at least one end-of-data reply"))
    }

    /// Best-effort; pooled connections skip it until eviction.
    pub async fn quit(mut self) {
        self.trail.sent("QUIT");
        let _ = self.stream.write_all(b"QUIT\r\n").await;
        let _ = self.stream.flush().await;
        self.stream.shutdown().await;
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count
    }

    /// Reuse requires a clean previous delivery and headroom on the
    /// per-connection message budget.
    pub fn reusable(&self, reuse_count: u32) -> bool {
        self.last_ok && self.usage_count < reuse_count
    }
}

/// Both family selections made for a delivery before the exchange address
/// family is known.
#[derive(Debug, Clone, Default)]
pub struct SourcePair {
    pub v4: Option<SourceAddress>,
    pub v6: Option<SourceAddress>,
}

enum AttemptError {
    /// Opportunistic TLS handshake failed: retry this host once over
    /// plaintext.
    RetryPlaintext(DeliveryError),
    /// Move on to the next address or exchange.
    Fail(DeliveryError),
    /// Stop the whole connect (policy refusals are not retried elsewhere).
    Abort(DeliveryError),
}

/// Per-attempt connector: walks the resolved exchanges, tries each address
/// once, drives greeting/EHLO/STARTTLS/AUTH, and hands back a session
/// ready for `MAIL FROM`.
pub struct Connector {
    pub ehlo_name: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,
    pub tls: TlsRequirement,
    pub lmtp: bool,
    pub auth: Option<Credentials>,
    pub prefer_ipv6: bool,
}

impl Connector {
    pub async fn connect(
        &self,
        records: &[ResolvedMx],
        sources: &SourcePair,
        tls_disabled: &Mutex<HashSet<String>>,
    ) -> Result<SmtpConnection, DeliveryError> {
        let mut last_error: Option<DeliveryError> = None;

        for record in records {
            for remote in self.ordered_addresses(record) {
                let source = match remote {
                    IpAddr::V4(_) => sources.v4.as_ref(),
                    IpAddr::V6(_) => sources.v6.as_ref(),
                };
                let Some(source) = source else {
                    continue;
                };

                let mut tls = if tls_disabled.lock().expect("tls set").contains(&record.exchange) {
                    TlsRequirement::Disabled
                } else {
                    self.tls
                };

                loop {
                    match self
                        .connect_one(&record.exchange, remote, source, tls)
                        .await
                    {
                        Ok(conn) => return Ok(conn),
                        Err(AttemptError::RetryPlaintext(err)) => {
                            warn!(
                                exchange = record.exchange,
                                "TLS handshake failed, retrying once in plaintext: {err}"
                            );
                            tls_disabled
                                .lock()
                                .expect("tls set")
                                .insert(record.exchange.clone());
                            tls = TlsRequirement::Disabled;
                            continue;
                        }
                        Err(AttemptError::Abort(err)) => return Err(err),
                        Err(AttemptError::Fail(err)) => {
                            debug!(
                                exchange = record.exchange,
                                %remote,
                                "connect attempt failed: {err}"
                            );
                            last_error = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DeliveryError::network("no reachable exchange address")))
    }

    fn ordered_addresses(&self, record: &ResolvedMx) -> Vec<IpAddr> {
        let v4 = record.a.iter().copied().map(IpAddr::V4);
        let v6 = record.aaaa.iter().copied().map(IpAddr::V6);
        if self.prefer_ipv6 {
            v6.chain(v4).collect()
        } else {
            v4.chain(v6).collect()
        }
    }

    async fn connect_one(
        &self,
        exchange: &str,
        remote_ip: IpAddr,
        source: &SourceAddress,
        tls: TlsRequirement,
    ) -> Result<SmtpConnection, AttemptError> {
        let remote = SocketAddr::new(remote_ip, self.port);
        let stream = self.open_socket(remote, source.address).await?;
        let local = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(source.address, 0));

        let ehlo_name = if source.ehlo_name.is_empty() {
            self.ehlo_name.clone()
        } else {
            source.ehlo_name.clone()
        };

        let mut conn = SmtpConnection {
            stream: Stream::Plain(stream),
            read_buf: Vec::new(),
            trail: LogTrail::default(),
            info: ConnectionInfo {
                exchange: exchange.to_string(),
                remote,
                local,
                ehlo_name: ehlo_name.clone(),
                tls: false,
                auth: false,
                lmtp: self.lmtp,
            },
            caps: Capabilities::default(),
            command_timeout: self.greeting_timeout,
            usage_count: 0,
            last_ok: true,
            rcpt_accepted: 0,
            data_tail: [b'\r', b'\n'],
            data_at_line_start: true,
        };

        // banner
        let banner = conn.read_reply("greeting").await.map_err(AttemptError::Fail)?;
        if banner.code != 220 {
            return Err(AttemptError::Fail(conn.reply_error(&banner)));
        }

        self.say_hello(&mut conn, &ehlo_name).await?;

        match tls {
            TlsRequirement::Disabled => {}
            TlsRequirement::Opportunistic if !conn.caps.starttls => {}
            TlsRequirement::Required if !conn.caps.starttls => {
                return Err(AttemptError::Abort(conn.fail(DeliveryError::policy(
                    format!("{exchange} does not advertise STARTTLS but TLS is required"),
                ))));
            }
            requirement => {
                let reply = conn.command("STARTTLS").await.map_err(AttemptError::Fail)?;
                if reply.code == 220 {
                    let strict = requirement == TlsRequirement::Required;
                    if let Err(err) = conn.upgrade_tls(exchange, strict).await {
                        let failure = DeliveryError::policy(format!(
                            "TLS handshake with {exchange} failed: {err}"
                        ));
                        return if strict {
                            Err(AttemptError::Abort(conn.fail(failure)))
                        } else {
                            Err(AttemptError::RetryPlaintext(conn.fail(failure)))
                        };
                    }
                    // the session restarts from the greeting state
                    self.say_hello(&mut conn, &ehlo_name).await?;
                } else if requirement == TlsRequirement::Required {
                    return Err(AttemptError::Abort(conn.reply_error(&reply)));
                } else {
                    conn.trail.note("continuing without TLS");
                }
            }
        }

        if let Some(credentials) = &self.auth {
            self.authenticate(&mut conn, credentials).await?;
        }

        Ok(conn)
    }

    async fn open_socket(
        &self,
        remote: SocketAddr,
        local_ip: IpAddr,
    ) -> Result<TcpStream, AttemptError> {
        let network_err = |message: String| AttemptError::Fail(DeliveryError::network(message));

        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|err| network_err(format!("socket setup failed: {err}")))?;

        if !local_ip.is_unspecified() {
            socket
                .bind(SocketAddr::new(local_ip, 0))
                .map_err(|err| network_err(format!("could not bind {local_ip}: {err}")))?;
        }

        match timeout(self.connect_timeout, socket.connect(remote)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Ok(Err(err)) => Err(network_err(format!("connect to {remote} failed: {err}"))),
            Err(_) => Err(network_err(format!("connect to {remote} timed out"))),
        }
    }

    async fn say_hello(
        &self,
        conn: &mut SmtpConnection,
        ehlo_name: &str,
    ) -> Result<(), AttemptError> {
        let verb = if self.lmtp { "LHLO" } else { "EHLO" };
        let reply = conn
            .command(&format!("{verb} {ehlo_name}"))
            .await
            .map_err(AttemptError::Fail)?;

        if reply.is_positive() {
            conn.caps = Capabilities::parse(&reply);
            return Ok(());
        }

        if self.lmtp {
            return Err(AttemptError::Fail(conn.reply_error(&reply)));
        }

        // ancient servers still answer HELO only
        let reply = conn
            .command(&format!("HELO {ehlo_name}"))
            .await
            .map_err(AttemptError::Fail)?;
        if !reply.is_positive() {
            return Err(AttemptError::Fail(conn.reply_error(&reply)));
        }
        conn.caps = Capabilities::default();
        Ok(())
    }

    async fn authenticate(
        &self,
        conn: &mut SmtpConnection,
        credentials: &Credentials,
    ) -> Result<(), AttemptError> {
        let token = Base64::encode_string(
            format!("\0{}\0{}", credentials.user, credentials.pass).as_bytes(),
        );
        let reply = conn
            .command(&format!("AUTH PLAIN {token}"))
            .await
            .map_err(AttemptError::Fail)?;
        if reply.code != 235 {
            return Err(AttemptError::Fail(conn.reply_error(&reply)));
        }
        conn.info.auth = true;
        Ok(())
    }
}

impl SmtpConnection {
    async fn upgrade_tls(&mut self, sni: &str, strict: bool) -> Result<(), std::io::Error> {
        let tcp = match std::mem::replace(&mut self.stream, Stream::Detached) {
            Stream::Plain(tcp) => tcp,
            other => {
                self.stream = other;
                return Err(std::io::ErrorKind::InvalidInput.into());
            }
        };

        let server_name = ServerName::try_from(sni.to_string())
            .unwrap_or(ServerName::IpAddress(self.info.remote.ip().into()));
        let connector = TlsConnector::from(tls_client_config(strict));
        match connector.connect(server_name, tcp).await {
            Ok(tls) => {
                self.read_buf.clear();
                self.stream = Stream::Tls(Box::new(tls));
                self.info.tls = true;
                self.trail.note("TLS established");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
