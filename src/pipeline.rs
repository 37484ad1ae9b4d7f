use crate::{
    classify::DeliveryError,
    delivery::Delivery,
    dkim::{self, DkimKeyStore, HashAlgo, RelaxedBodyHasher},
    headers::Headers,
    smtp::SmtpConnection,
    store::MessageStore,
};
use humansize::{DECIMAL, format_size};
use md5::{Digest, Md5};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const CHUNK: usize = 16 * 1024;

/// Observability record of one streamed send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub response: String,
    /// MD5 of the body bytes exactly as read from the store.
    pub sent_body_hash: String,
    pub sent_body_size: u64,
    pub elapsed: Duration,
    pub md5_match: bool,
}

/// Add the requested DKIM signatures on top of the header block. Each
/// signature is pushed above the previous one, leaving the last configured
/// key outermost. A missing body hash is computed by streaming the stored
/// body through the relaxed canonicalizer; an unusable key skips that
/// signature rather than failing the delivery.
pub async fn apply_dkim(
    delivery: &Delivery,
    headers: &mut Headers,
    keys: &DkimKeyStore,
    store: &dyn MessageStore,
) -> Result<(), DeliveryError> {
    let Some(request) = &delivery.dkim else {
        return Ok(());
    };

    for spec in &request.keys {
        let algo = spec
            .hash_algo
            .as_deref()
            .map(HashAlgo::parse)
            .unwrap_or_default();

        let key = match &spec.private_key {
            Some(pem) => match dkim::parse_private_key(&spec.domain, pem.as_bytes()) {
                Ok(key) => std::sync::Arc::new(key),
                Err(err) => {
                    warn!(
                        domain = spec.domain,
                        selector = spec.selector,
                        "skipping DKIM signature: {err}"
                    );
                    continue;
                }
            },
            None => match keys.lookup(&spec.domain, &spec.selector) {
                Some(key) => key,
                None => {
                    warn!(
                        domain = spec.domain,
                        selector = spec.selector,
                        "skipping DKIM signature: no key loaded"
                    );
                    continue;
                }
            },
        };

        let body_hash = match &spec.body_hash {
            Some(hash) => hash.clone(),
            None => compute_body_hash(delivery, algo, store).await?,
        };

        match dkim::create_signature(
            &key,
            algo,
            &spec.domain,
            &spec.selector,
            &body_hash,
            headers,
        ) {
            Ok(header) => headers.add_at(0, header),
            Err(err) => warn!(
                domain = spec.domain,
                selector = spec.selector,
                "skipping DKIM signature: {err}"
            ),
        }
    }

    Ok(())
}

async fn compute_body_hash(
    delivery: &Delivery,
    algo: HashAlgo,
    store: &dyn MessageStore,
) -> Result<String, DeliveryError> {
    let mut stream = store
        .retrieve(&delivery.id)
        .await
        .map_err(store_unavailable)?;

    let mut hasher = RelaxedBodyHasher::new(algo);
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|err| store_unavailable(crate::store::StoreError::Io(err)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_base64())
}

/// Stream the message through an established session: canonical header
/// block first, then the stored body through an MD5 tap and byte counter
/// into the DATA channel. Backpressure comes from the socket; chunks are
/// only read as fast as they are written out.
pub async fn send_message(
    conn: &mut SmtpConnection,
    delivery: &Delivery,
    headers: &Headers,
    store: &dyn MessageStore,
) -> Result<SendOutcome, DeliveryError> {
    let header_block = headers.build_with_terminator();
    let size_hint = delivery.body_size + header_block.len() as u64;

    conn.mail_from(&delivery.from, size_hint).await?;
    conn.rcpt_to(&delivery.recipient).await?;
    conn.data_start().await?;

    conn.write_body_chunk(header_block.as_bytes()).await?;

    let mut stream = store
        .retrieve(&delivery.id)
        .await
        .map_err(|err| store_unavailable(err).with_trail(conn.trail.snapshot()))?;

    let started = Instant::now();
    let mut md5 = Md5::new();
    let mut sent = 0u64;
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = stream.read(&mut buf).await.map_err(|err| {
            store_unavailable(crate::store::StoreError::Io(err))
                .with_trail(conn.trail.snapshot())
        })?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sent += n as u64;
        conn.write_body_chunk(&buf[..n]).await?;
    }

    let reply = conn.finish_data().await?;
    let elapsed = started.elapsed();

    let sent_body_hash = hex(&md5.finalize());
    let md5_match = delivery
        .source_md5
        .as_deref()
        .map(|expected| expected.eq_ignore_ascii_case(&sent_body_hash))
        // nothing to compare against
        .unwrap_or(true);

    debug!(
        id = delivery.id,
        seq = delivery.seq,
        size = format_size(sent, DECIMAL),
        ?elapsed,
        md5_match,
        "message streamed"
    );

    Ok(SendOutcome {
        response: reply.text(),
        sent_body_hash,
        sent_body_size: sent,
        elapsed,
        md5_match,
    })
}

/// HTTP sink: the same message content goes out as a multipart/form-data
/// POST instead of SMTP. 2xx is accepted; anything else classifies with
/// the synthesized status code and bouncing suppressed.
pub async fn send_http(
    client: &reqwest::Client,
    delivery: &Delivery,
    headers: &Headers,
    store: &dyn MessageStore,
) -> Result<SendOutcome, DeliveryError> {
    let target: url::Url = delivery
        .target_url
        .as_deref()
        .ok_or_else(|| DeliveryError::http(500, "http delivery without targetUrl"))?
        .parse()
        .map_err(|err| DeliveryError::http(500, format!("invalid targetUrl: {err}")))?;

    let mut stream = store
        .retrieve(&delivery.id)
        .await
        .map_err(store_unavailable)?;
    let mut body = Vec::with_capacity(delivery.body_size as usize);
    stream
        .read_to_end(&mut body)
        .await
        .map_err(|err| store_unavailable(crate::store::StoreError::Io(err)))?;

    let started = Instant::now();
    let mut md5 = Md5::new();
    md5.update(&body);
    let sent_body_size = body.len() as u64;
    let sent_body_hash = hex(&md5.finalize());
    let md5_match = delivery
        .source_md5
        .as_deref()
        .map(|expected| expected.eq_ignore_ascii_case(&sent_body_hash))
        .unwrap_or(true);

    let mut message = headers.build_with_terminator().into_bytes();
    message.extend_from_slice(&body);

    let form = reqwest::multipart::Form::new()
        .text("id", delivery.id.clone())
        .text("to", delivery.recipient.clone())
        .part(
            "message",
            reqwest::multipart::Part::bytes(message)
                .file_name(format!("{}.eml", delivery.id))
                .mime_str("message/rfc822")
                .expect("static mime type"),
        );

    let response = client
        .post(target.clone())
        .multipart(form)
        .send()
        .await
        .map_err(|err| DeliveryError::http(502, format!("POST {target} failed: {err}")))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(DeliveryError::http(
            status.as_u16(),
            format!("{target} answered {status}: {}", text.trim()),
        ));
    }

    Ok(SendOutcome {
        response: format!("{target} accepted the message ({status})"),
        sent_body_hash,
        sent_body_size,
        elapsed: started.elapsed(),
        md5_match,
    })
}

fn store_unavailable(err: crate::store::StoreError) -> DeliveryError {
    let mut failure = DeliveryError::network(format!("message body unavailable: {err}"));
    failure.temporary = Some(true);
    failure
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        delivery::Delivery,
        dns::ResolvedMx,
        smtp::{TlsRequirement, client::{Connector, SourcePair}},
        store::memory::MemoryStore,
        test::MockSmtpServer,
    };
    use crate::delivery::SourceAddress;

    fn delivery(id: &str) -> Delivery {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "seq": "001",
            "from": "sender@example.net",
            "recipient": "rcpt@example.test",
            "domain": "example.test",
            "headers": ["From: sender@example.net", "Subject: hi"],
            "bodySize": 7,
            "_lock": "l",
        }))
        .unwrap()
    }

    async fn open(server: &MockSmtpServer) -> SmtpConnection {
        Connector {
            ehlo_name: "sender.example.net".into(),
            port: server.port(),
            connect_timeout: Duration::from_secs(5),
            greeting_timeout: Duration::from_secs(5),
            tls: TlsRequirement::Opportunistic,
            lmtp: false,
            auth: None,
            prefer_ipv6: false,
        }
        .connect(
            &[ResolvedMx {
                exchange: "mx.example.test".into(),
                priority: 0,
                a: vec!["127.0.0.1".parse().unwrap()],
                aaaa: vec![],
            }],
            &SourcePair {
                v4: Some(SourceAddress {
                    address: "127.0.0.1".parse().unwrap(),
                    ehlo_name: String::new(),
                }),
                v6: None,
            },
            &Default::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn streams_headers_and_body() {
        let server = MockSmtpServer::builder().spawn().await;
        let store = MemoryStore::with("m1", b"body\r\n");
        let delivery = delivery("m1");
        let headers = delivery.parse_headers();

        let mut conn = open(&server).await;
        let outcome = send_message(&mut conn, &delivery, &headers, &store)
            .await
            .unwrap();

        assert_eq!(outcome.sent_body_size, 6);
        assert!(outcome.md5_match);
        let state = server.state();
        assert_eq!(
            state.messages[0],
            b"From: sender@example.net\r\nSubject: hi\r\n\r\nbody\r\n"
        );
    }

    #[tokio::test]
    async fn md5_tap_checks_the_source_digest() {
        let server = MockSmtpServer::builder().spawn().await;
        let store = MemoryStore::with("m1", b"body\r\n");
        let mut delivery = delivery("m1");
        // md5("body\r\n")
        delivery.source_md5 = Some("89dd3590116a70b579661a2d8593bb2f".into());
        let headers = delivery.parse_headers();

        let mut conn = open(&server).await;
        let outcome = send_message(&mut conn, &delivery, &headers, &store)
            .await
            .unwrap();
        assert_eq!(outcome.sent_body_hash, "89dd3590116a70b579661a2d8593bb2f");
        assert!(outcome.md5_match);

        // a mismatching digest is informational only
        let store = MemoryStore::with("m1", b"other\r\n");
        let mut conn = open(&server).await;
        let outcome = send_message(&mut conn, &delivery, &headers, &store)
            .await
            .unwrap();
        assert!(!outcome.md5_match);
    }

    #[tokio::test]
    async fn dkim_headers_are_prepended_outermost_last() {
        let store = MemoryStore::with("m1", b"Hello World\r\n");
        let mut delivery = delivery("m1");
        delivery.dkim = Some(
            serde_json::from_value(serde_json::json!({
                "keys": [
                    {"domain": "example.net", "selector": "one",
                     "privateKey": crate::dkim::TEST_KEY_PEM},
                    {"domain": "example.net", "selector": "two",
                     "privateKey": crate::dkim::TEST_KEY_PEM},
                ]
            }))
            .unwrap(),
        );

        let mut headers = delivery.parse_headers();
        apply_dkim(&delivery, &mut headers, &DkimKeyStore::empty(), &store)
            .await
            .unwrap();

        let signatures = headers.get_all("dkim-signature");
        assert_eq!(signatures.len(), 2);
        // last configured key signs last, ending up outermost
        assert!(signatures[0].contains("s=two;"));
        assert!(signatures[1].contains("s=one;"));
        // body hash computed from the stored body
        assert!(signatures[1].contains("bh=sIAi0xXPHrEtJmW97Q5q9AZTwKC+l1Iy+0m8vQIc/DY=;"));
    }

    #[tokio::test]
    async fn unusable_key_skips_signature_but_delivers() {
        let store = MemoryStore::with("m1", b"x\r\n");
        let mut delivery = delivery("m1");
        delivery.dkim = Some(
            serde_json::from_value(serde_json::json!({
                "keys": [{"domain": "example.net", "selector": "none"}]
            }))
            .unwrap(),
        );
        let mut headers = delivery.parse_headers();
        apply_dkim(&delivery, &mut headers, &DkimKeyStore::empty(), &store)
            .await
            .unwrap();
        assert!(headers.get_first("dkim-signature").is_none());
    }

    #[tokio::test]
    async fn missing_body_defers() {
        let server = MockSmtpServer::builder().spawn().await;
        let store = MemoryStore::default();
        let delivery = delivery("gone");
        let headers = delivery.parse_headers();

        let mut conn = open(&server).await;
        let err = send_message(&mut conn, &delivery, &headers, &store)
            .await
            .unwrap_err();
        assert_eq!(err.category.as_deref(), Some("network"));
        assert_eq!(err.temporary, Some(true));
    }
}
