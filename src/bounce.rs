use crate::{
    broker::BounceRequest,
    classify::Verdict,
    delivery::Delivery,
    headers::Headers,
};
use chrono::{DateTime, Utc};
use mail_builder::{
    MessageBuilder,
    headers::{content_type::ContentType, text::Text},
    mime::MimePart,
};
use mail_parser::{MessageParser, MimeHeaders};
use tracing::info;

/// Kind of delivery status notification to compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnKind {
    Failed,
    Delayed,
}

/// Everything the composer needs that is not on the delivery itself.
pub struct DsnContext<'a> {
    pub zone: &'a str,
    pub reporting_mta: &'a str,
    pub mx_hostname: Option<&'a str>,
    pub arrival: Option<DateTime<Utc>>,
}

/// Why a DSN must not be sent for this delivery, if any. Checked before
/// composing either the failure or the delayed notification.
pub fn suppression_reason(delivery: &Delivery, headers: &Headers) -> Option<String> {
    if delivery.envelope_from_empty() {
        return Some("envelope sender is empty".into());
    }
    if delivery
        .from
        .to_ascii_lowercase()
        .starts_with("mailer-daemon@")
    {
        return Some("envelope sender is a mailer daemon".into());
    }
    if delivery.state.skip_bounce {
        return Some("bouncing is disabled for this delivery".into());
    }

    if let Some(value) = headers.get_first("x-auto-response-suppress") {
        if value.to_ascii_lowercase().contains("all") {
            return Some("X-Auto-Response-Suppress requests no responses".into());
        }
    }

    if let Some(value) = headers.get_first("auto-submitted") {
        let value = value.to_ascii_lowercase();
        if value.starts_with("auto-generated") || value.starts_with("auto-replied") {
            return Some(format!("Auto-Submitted: {value}"));
        }
    }

    if let Some(value) = headers.get_first("content-type") {
        if value.to_ascii_lowercase().starts_with("multipart/report") {
            return Some("message is already a delivery report".into());
        }
    }

    // the From: header may name a daemon even when the envelope does not
    let raw = headers.build_with_terminator();
    if let Some(parsed) = MessageParser::default().parse_headers(raw.as_bytes()) {
        if let Some(from) = parsed.from().and_then(|from| from.first()) {
            if let Some(address) = from.address() {
                if address.to_ascii_lowercase().starts_with("mailer-daemon@") {
                    return Some("From header is a mailer daemon".into());
                }
            }
        }
    }

    if headers.count("received") > 25 {
        return Some("too many Received hops".into());
    }

    None
}

/// Build the `multipart/report` DSN for a rejected (or delayed) delivery.
pub fn compose_dsn(
    kind: DsnKind,
    delivery: &Delivery,
    headers: &Headers,
    verdict: &Verdict,
    ctx: &DsnContext<'_>,
) -> Vec<u8> {
    let (subject, summary, action) = match kind {
        DsnKind::Failed => (
            "Delivery Status Notification (Failure)",
            format!(
                "Delivery to the following recipient failed permanently:\r\n\r\n    {}\r\n\r\n\
                 Technical details of permanent failure:\r\n{}\r\n",
                delivery.recipient, verdict.message
            ),
            "failed",
        ),
        DsnKind::Delayed => (
            "Delivery Status Notification (Delay)",
            format!(
                "Delivery to the following recipient has been delayed:\r\n\r\n    {}\r\n\r\n\
                 The message has not been dropped; delivery attempts continue.\r\n\
                 Latest response from the remote server:\r\n{}\r\n",
                delivery.recipient, verdict.message
            ),
            "delayed",
        ),
    };

    let status = verdict.enhanced.clone().unwrap_or_else(|| {
        match verdict.code {
            Some(code) if code >= 500 => "5.0.0".to_string(),
            Some(_) => "4.0.0".to_string(),
            None if action == "failed" => "5.0.0".to_string(),
            None => "4.0.0".to_string(),
        }
    });

    let mut report = format!(
        "Reporting-MTA: dns; {}\r\nX-Mailrush-Queue-ID: {}\r\nX-Mailrush-Sender: rfc822; {}\r\n",
        ctx.reporting_mta, delivery.id, delivery.from
    );
    if let Some(arrival) = ctx.arrival {
        report.push_str(&format!("Arrival-Date: {}\r\n", arrival.to_rfc2822()));
    }
    report.push_str(&format!(
        "\r\nFinal-Recipient: rfc822; {}\r\nAction: {}\r\nStatus: {}\r\n",
        delivery.recipient, action, status
    ));
    if let Some(mx) = ctx.mx_hostname {
        report.push_str(&format!("Remote-MTA: dns; {mx}\r\n"));
    }
    report.push_str(&format!(
        "Diagnostic-Code: smtp; {}\r\n",
        verdict
            .code
            .map(|code| format!("{code} {}", verdict.message))
            .unwrap_or_else(|| verdict.message.clone())
    ));

    let original_headers = headers.build();

    let body = MimePart::new(
        ContentType::new("multipart/report").attribute("report-type", "delivery-status"),
        vec![
            MimePart::new(
                ContentType::new("text/plain").attribute("charset", "utf-8"),
                summary,
            ),
            MimePart::new(ContentType::new("message/delivery-status"), report),
            MimePart::new(ContentType::new("text/rfc822-headers"), original_headers),
        ],
    );

    let daemon = format!("mailer-daemon@{}", ctx.reporting_mta);
    MessageBuilder::new()
        .from(("Mail Delivery Subsystem", daemon.as_str()))
        .to(delivery.from.as_str())
        .subject(subject)
        .header(
            "Message-ID",
            Text::new(format!("<{}@{}>", uuid::Uuid::new_v4(), ctx.reporting_mta)),
        )
        .header("Auto-Submitted", Text::new("auto-replied"))
        .body(body)
        .write_to_vec()
        .expect("writing to a vec cannot fail")
}

/// Assemble the BOUNCE command that requeues the DSN as a new envelope
/// (`from: <>`, the original sender as recipient).
pub fn build_bounce_request(
    delivery: &Delivery,
    verdict: &Verdict,
    ctx: &DsnContext<'_>,
    dsn: Vec<u8>,
) -> BounceRequest {
    BounceRequest {
        id: delivery.id.clone(),
        session_id: delivery.session_id.clone(),
        zone: ctx.zone.to_string(),
        interface: "bounce".to_string(),
        from: String::new(),
        to: delivery.from.clone(),
        seq: delivery.seq.clone(),
        headers: delivery.headers.clone(),
        address: delivery
            .state
            .local_address
            .map(|address| address.to_string()),
        name: ctx.reporting_mta.to_string(),
        mx_hostname: ctx.mx_hostname.map(str::to_string),
        return_path: delivery.from.clone(),
        category: verdict.category.clone(),
        time: Utc::now(),
        arrival_date: ctx.arrival,
        response: verdict.message.clone(),
        fbl: None,
        message: String::from_utf8_lossy(&dsn).into_owned(),
    }
}

/// Log-and-skip entry point used by the worker when suppression applies.
pub fn log_suppressed(delivery: &Delivery, reason: &str) {
    info!(
        id = delivery.id,
        seq = delivery.seq,
        recipient = delivery.recipient,
        "not sending a bounce: {reason}"
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classify::Action;

    fn delivery() -> Delivery {
        serde_json::from_value(serde_json::json!({
            "id": "m1",
            "seq": "003",
            "from": "sender@example.net",
            "recipient": "rcpt@example.test",
            "domain": "example.test",
            "headers": [
                "From: Real Sender <sender@example.net>",
                "To: rcpt@example.test",
                "Subject: original subject",
            ],
            "_lock": "l",
        }))
        .unwrap()
    }

    fn verdict() -> Verdict {
        Verdict {
            action: Action::Reject,
            category: "recipient".into(),
            message: "Recipient address was rejected by the remote server".into(),
            code: Some(550),
            enhanced: Some("5.1.1".into()),
            ttl: None,
        }
    }

    fn ctx<'a>() -> DsnContext<'a> {
        DsnContext {
            zone: "default",
            reporting_mta: "mx1.example.net",
            mx_hostname: Some("mx.example.test"),
            arrival: Some(Utc::now()),
        }
    }

    #[test]
    fn plain_delivery_is_not_suppressed() {
        let delivery = delivery();
        let headers = delivery.parse_headers();
        assert_eq!(suppression_reason(&delivery, &headers), None);
    }

    #[test]
    fn suppression_covers_the_rule_table() {
        let base = delivery();

        let mut d = base.clone();
        d.from = "".into();
        assert!(suppression_reason(&d, &d.parse_headers()).is_some());

        let mut d = base.clone();
        d.from = "MAILER-DAEMON@example.net".into();
        assert!(suppression_reason(&d, &d.parse_headers()).is_some());

        let mut d = base.clone();
        d.state.skip_bounce = true;
        assert!(suppression_reason(&d, &d.parse_headers()).is_some());

        let mut d = base.clone();
        d.headers.push("X-Auto-Response-Suppress: OOF, DR, All".into());
        assert!(suppression_reason(&d, &d.parse_headers()).is_some());

        let mut d = base.clone();
        d.headers.push("Auto-Submitted: auto-replied".into());
        let reason = suppression_reason(&d, &d.parse_headers()).unwrap();
        assert!(reason.contains("Auto-Submitted"));

        let mut d = base.clone();
        d.headers
            .push("Content-Type: multipart/report; report-type=delivery-status".into());
        assert!(suppression_reason(&d, &d.parse_headers()).is_some());

        let mut d = base.clone();
        d.headers = vec!["From: Postmaster <mailer-daemon@example.org>".into()];
        assert!(suppression_reason(&d, &d.parse_headers()).is_some());

        let mut d = base.clone();
        for i in 0..26 {
            d.headers.push(format!("Received: from hop{i}.example.org"));
        }
        assert!(suppression_reason(&d, &d.parse_headers()).is_some());

        // Auto-Submitted: no is explicitly not auto-generated
        let mut d = base.clone();
        d.headers.push("Auto-Submitted: no".into());
        assert_eq!(suppression_reason(&d, &d.parse_headers()), None);
    }

    #[test]
    fn dsn_has_three_report_parts() {
        let delivery = delivery();
        let headers = delivery.parse_headers();
        let dsn = compose_dsn(DsnKind::Failed, &delivery, &headers, &verdict(), &ctx());

        let parsed = MessageParser::default().parse(&dsn).unwrap();
        let content_type = parsed.content_type().unwrap();
        assert_eq!(content_type.ctype(), "multipart");
        assert_eq!(content_type.subtype(), Some("report"));

        let text = String::from_utf8_lossy(&dsn);
        assert!(text.contains("report-type=delivery-status"));
        assert!(text.contains("failed permanently"));
        assert!(text.contains("Final-Recipient: rfc822; rcpt@example.test"));
        assert!(text.contains("Action: failed"));
        assert!(text.contains("Status: 5.1.1"));
        assert!(text.contains("Remote-MTA: dns; mx.example.test"));
        assert!(text.contains("Diagnostic-Code: smtp; 550"));
        assert!(text.contains("Subject: original subject"));
        assert!(text.contains("Auto-Submitted: auto-replied"));
    }

    #[test]
    fn delayed_dsn_reports_a_delay() {
        let delivery = delivery();
        let headers = delivery.parse_headers();
        let mut verdict = verdict();
        verdict.code = Some(421);
        verdict.enhanced = None;
        let dsn = compose_dsn(DsnKind::Delayed, &delivery, &headers, &verdict, &ctx());

        let text = String::from_utf8_lossy(&dsn);
        assert!(text.contains("Delivery Status Notification (Delay)"));
        assert!(text.contains("Action: delayed"));
        assert!(text.contains("Status: 4.0.0"));
    }

    #[test]
    fn bounce_request_reverses_the_envelope() {
        let delivery = delivery();
        let headers = delivery.parse_headers();
        let dsn = compose_dsn(DsnKind::Failed, &delivery, &headers, &verdict(), &ctx());
        let request = build_bounce_request(&delivery, &verdict(), &ctx(), dsn);

        assert_eq!(request.from, "");
        assert_eq!(request.to, "sender@example.net");
        assert_eq!(request.interface, "bounce");
        assert_eq!(request.category, "recipient");
        assert!(request.message.contains("Final-Recipient"));
    }
}
