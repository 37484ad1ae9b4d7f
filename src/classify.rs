use arc_swap::ArcSwap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::info;

/// Well-known error categories set upstream of the rule table.
pub mod category {
    pub const DNS: &str = "dns";
    pub const NETWORK: &str = "network";
    pub const POLICY: &str = "policy";
    pub const HTTP: &str = "http";
    pub const BLACKLIST: &str = "blacklist";
    pub const PLUGIN: &str = "plugin";
    pub const PROTOCOL: &str = "protocol";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Defer,
    Reject,
}

/// Protocol the failing attempt was speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Smtp,
    Lmtp,
    Http,
}

/// One line of the captured SMTP transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailLine {
    pub dir: TrailDir,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailDir {
    Sent,
    Received,
}

/// A failed delivery attempt on its way to the classifier. Everything the
/// classifier needs travels on this value; nothing is recovered locally.
#[derive(Debug, Clone, Error)]
#[error("{response}")]
pub struct DeliveryError {
    /// Humanized server response or failure description.
    pub response: String,
    /// Category preset upstream (dns/network/policy/http/blacklist/plugin);
    /// `None` lets the rule table decide.
    pub category: Option<String>,
    /// Response code when one is known without parsing `response`.
    pub code: Option<u16>,
    pub temporary: Option<bool>,
    /// Explicit action override; wins over every classification step.
    pub action: Option<Action>,
    pub protocol: Protocol,
    pub logtrail: Vec<TrailLine>,
}

impl DeliveryError {
    fn bare(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            category: None,
            code: None,
            temporary: None,
            action: None,
            protocol: Protocol::Smtp,
            logtrail: Vec::new(),
        }
    }

    pub fn network(response: impl Into<String>) -> Self {
        Self {
            category: Some(category::NETWORK.into()),
            temporary: Some(true),
            ..Self::bare(response)
        }
    }

    pub fn dns(response: impl Into<String>) -> Self {
        Self {
            category: Some(category::DNS.into()),
            temporary: Some(true),
            ..Self::bare(response)
        }
    }

    pub fn policy(response: impl Into<String>) -> Self {
        Self {
            category: Some(category::POLICY.into()),
            temporary: Some(false),
            ..Self::bare(response)
        }
    }

    pub fn plugin(response: impl Into<String>) -> Self {
        Self {
            category: Some(category::PLUGIN.into()),
            temporary: Some(true),
            ..Self::bare(response)
        }
    }

    pub fn http(code: u16, response: impl Into<String>) -> Self {
        Self {
            category: Some(category::HTTP.into()),
            code: Some(code),
            protocol: Protocol::Http,
            ..Self::bare(response)
        }
    }

    /// A raw SMTP/LMTP rejection line; code and category are extracted by
    /// the classifier.
    pub fn smtp(response: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Self::bare(response)
        }
    }

    pub fn with_trail(mut self, logtrail: Vec<TrailLine>) -> Self {
        self.logtrail = logtrail;
        self
    }
}

/// One ordered rule of the bounce table; first match wins.
#[derive(Debug)]
pub struct BounceRule {
    pub regex: Regex,
    pub action: Action,
    pub category: String,
    pub message: String,
    pub line: u32,
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule file line {line}: {reason}")]
    Invalid { line: u32, reason: String },
    #[error("could not read rule file: {0}")]
    Read(#[from] std::io::Error),
}

/// Immutable, atomically replaceable rule list. Readers pin the current
/// list for the duration of one classification.
pub struct BounceRules {
    rules: ArcSwap<Vec<BounceRule>>,
}

impl BounceRules {
    pub fn builtin() -> Self {
        Self {
            rules: ArcSwap::from_pointee(
                Self::parse(DEFAULT_RULES).expect("builtin rule table parses"),
            ),
        }
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, RuleError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self {
            rules: ArcSwap::from_pointee(Self::parse(&text)?),
        })
    }

    /// Swap in a new table from the rule file; the old list keeps serving
    /// in-flight classifications.
    pub fn reload(&self, path: &std::path::Path) -> Result<(), RuleError> {
        let text = std::fs::read_to_string(path)?;
        let rules = Self::parse(&text)?;
        info!(count = rules.len(), "bounce rule table replaced");
        self.rules.store(Arc::new(rules));
        Ok(())
    }

    pub fn pin(&self) -> Arc<Vec<BounceRule>> {
        self.rules.load_full()
    }

    /// `<regex>,<action>,<category>,<message-with-commas>` per non-empty
    /// non-`#` line.
    pub fn parse(text: &str) -> Result<Vec<BounceRule>, RuleError> {
        let mut rules = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx as u32 + 1;
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }

            let mut parts = raw.splitn(4, ',');
            let pattern = parts.next().unwrap_or_default().trim();
            let action = parts.next().unwrap_or_default().trim();
            let category = parts.next().unwrap_or_default().trim();
            let message = parts.next().unwrap_or_default().trim();
            if pattern.is_empty() || category.is_empty() {
                return Err(RuleError::Invalid {
                    line,
                    reason: "expected <regex>,<action>,<category>,<message>".into(),
                });
            }

            let action = match action {
                "reject" => Action::Reject,
                "defer" => Action::Defer,
                other => {
                    return Err(RuleError::Invalid {
                        line,
                        reason: format!("unknown action {other:?}"),
                    });
                }
            };

            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .multi_line(true)
                .build()
                .map_err(|err| RuleError::Invalid {
                    line,
                    reason: err.to_string(),
                })?;

            rules.push(BounceRule {
                regex,
                action,
                category: category.to_string(),
                message: message.to_string(),
                line,
            });
        }
        Ok(rules)
    }
}

/// Rule table compiled into the binary, used until a rule file is
/// configured. Order matters.
const DEFAULT_RULES: &str = "\
# <regex>,<action>,<category>,<message>
spamhaus|spamcop|barracuda|blocklist|blacklist|blocked using|banned sending ip,reject,blacklist,Sending IP is listed on a blocking service
user unknown|unknown user|no such user|unknown recipient|invalid recipient|recipient .*(rejected|unknown)|address rejected|mailbox unavailable|does not exist,reject,recipient,Recipient address was rejected by the remote server
mailbox .*full|over quota|quota exceeded|insufficient.*storage,defer,quota,Recipient mailbox is over quota
greylist|greylisted|try again later|please retry|temporar(il)?y deferred|temporarily rejected,defer,greylist,Recipient server asked to retry later
too many (connections|messages|recipients)|rate limit|throttl|connection frequency,defer,throttle,Recipient server is rate limiting us
spam|content rejected|message rejected|rejected due to content|virus|policy rejection,reject,spam,Message content was rejected by the remote server
relay(ing)? (denied|not permitted)|not authorized to relay|open relay,reject,relay,Remote server refused to relay the message
";

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    pub category: String,
    pub message: String,
    pub code: Option<u16>,
    pub enhanced: Option<String>,
    /// Set for `Defer`: requeue TTL from the defer schedule.
    pub ttl: Option<Duration>,
}

/// Default defer schedule, minutes per slot. `deferred_count` is 0-based;
/// running past the end promotes the verdict to reject.
pub const DEFER_SCHEDULE_MIN: [u64; 17] = [
    5, 7, 8, 25, 75, 120, 240, 240, 240, 240, 240, 240, 240, 240, 240, 240, 240,
];

/// TTL for the next defer slot, `None` once the schedule is exhausted.
pub fn defer_ttl(deferred_count: u32, defer_times_ms: Option<&[u64]>) -> Option<Duration> {
    match defer_times_ms {
        Some(times) => times
            .get(deferred_count as usize)
            .map(|ms| Duration::from_millis(*ms)),
        None => DEFER_SCHEDULE_MIN
            .get(deferred_count as usize)
            .map(|minutes| Duration::from_secs(minutes * 60)),
    }
}

/// Extract `NNN` and the optional `x.y.z` enhanced status from a server
/// response line.
fn extract_codes(response: &str) -> Option<(u16, Option<String>)> {
    let trimmed = response.trim_start();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() != 3 {
        return None;
    }
    let code: u16 = digits.parse().ok()?;
    if !(200..600).contains(&code) {
        return None;
    }

    let rest = trimmed[3..].trim_start_matches(['-', ' ']);
    let enhanced = rest
        .split_whitespace()
        .next()
        .filter(|token| {
            let mut parts = token.split('.');
            parts.clone().count() == 3 && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        })
        .map(str::to_string);

    Some((code, enhanced))
}

/// Classification context that lives on the delivery rather than the error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext {
    pub deferred_count: u32,
    pub pool_disabled: bool,
    pub envelope_from_empty: bool,
}

/// Turn a failed attempt into a verdict. Pure: same inputs, same outputs.
pub fn classify(
    err: &DeliveryError,
    rules: &[BounceRule],
    ctx: ClassifyContext,
    defer_times_ms: Option<&[u64]>,
) -> Verdict {
    let mut verdict = classify_action(err, rules);

    // explicit action override wins over everything derived
    if let Some(action) = err.action {
        verdict.action = action;
    }

    // a blacklisted source with no addresses left (or a bounce of a
    // bounce) has nothing to gain from deferring
    if verdict.category == category::BLACKLIST
        && (ctx.pool_disabled || ctx.envelope_from_empty)
    {
        verdict.action = Action::Reject;
    }

    match verdict.action {
        Action::Reject => verdict.ttl = None,
        Action::Defer => match defer_ttl(ctx.deferred_count, defer_times_ms) {
            Some(ttl) => verdict.ttl = Some(ttl),
            // schedule exhausted: promote
            None => {
                verdict.action = Action::Reject;
                verdict.ttl = None;
            }
        },
    }

    verdict
}

fn classify_action(err: &DeliveryError, rules: &[BounceRule]) -> Verdict {
    if err.protocol == Protocol::Http {
        let code = err.code.unwrap_or(500);
        let action = if (400..500).contains(&code) {
            Action::Reject
        } else {
            Action::Defer
        };
        return Verdict {
            action,
            category: category::HTTP.into(),
            message: err.response.clone(),
            code: Some(code),
            enhanced: None,
            ttl: None,
        };
    }

    if let Some(preset) = err.category.as_deref() {
        if matches!(
            preset,
            category::DNS | category::NETWORK | category::POLICY | category::PLUGIN
        ) {
            let action = if err.temporary.unwrap_or(false) || err.action == Some(Action::Defer) {
                Action::Defer
            } else {
                Action::Reject
            };
            return Verdict {
                action,
                category: preset.to_string(),
                message: err.response.clone(),
                code: err.code,
                enhanced: None,
                ttl: None,
            };
        }
    }

    let Some((code, enhanced)) = extract_codes(&err.response) else {
        // no SMTP-shaped reply to reason about: treat as a network blip
        return Verdict {
            action: Action::Defer,
            category: category::NETWORK.into(),
            message: err.response.clone(),
            code: err.code,
            enhanced: None,
            ttl: None,
        };
    };

    for rule in rules {
        if rule.regex.is_match(&err.response) {
            let mut action = rule.action;
            // dns-hinted rules stay deferrable while the server still
            // answers with a non-permanent code
            if rule.category == category::DNS && code <= 500 {
                action = Action::Defer;
            }
            return Verdict {
                action,
                category: rule.category.clone(),
                message: rule.message.clone(),
                code: Some(code),
                enhanced,
                ttl: None,
            };
        }
    }

    let action = if code < 500 {
        Action::Defer
    } else {
        Action::Reject
    };
    Verdict {
        action,
        category: category::PROTOCOL.into(),
        message: err.response.clone(),
        code: Some(code),
        enhanced,
        ttl: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rules() -> Vec<BounceRule> {
        BounceRules::parse(DEFAULT_RULES).unwrap()
    }

    fn ctx() -> ClassifyContext {
        ClassifyContext::default()
    }

    #[test]
    fn transient_reply_defers_with_first_slot() {
        let err = DeliveryError::smtp("421 4.7.1 Try later", Protocol::Smtp);
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Defer);
        assert_eq!(verdict.code, Some(421));
        assert_eq!(verdict.enhanced.as_deref(), Some("4.7.1"));
        assert_eq!(verdict.ttl, Some(Duration::from_secs(5 * 60)));
    }

    #[test]
    fn defer_schedule_walks_the_table() {
        let err = DeliveryError::smtp("421 4.7.1 Try later", Protocol::Smtp);
        let expected_minutes = [5u64, 7, 8, 25, 75, 120, 240];
        for (count, minutes) in expected_minutes.iter().enumerate() {
            let verdict = classify(
                &err,
                &rules(),
                ClassifyContext {
                    deferred_count: count as u32,
                    ..ctx()
                },
                None,
            );
            assert_eq!(verdict.action, Action::Defer);
            assert_eq!(verdict.ttl, Some(Duration::from_secs(minutes * 60)));
        }
    }

    #[test]
    fn exhausted_schedule_promotes_to_reject() {
        let err = DeliveryError::smtp("421 4.7.1 Try later", Protocol::Smtp);
        let verdict = classify(
            &err,
            &rules(),
            ClassifyContext {
                deferred_count: 17,
                ..ctx()
            },
            None,
        );
        assert_eq!(verdict.action, Action::Reject);
        assert_eq!(verdict.ttl, None);
    }

    #[test]
    fn delivery_defer_times_override_schedule() {
        let err = DeliveryError::smtp("450 try later", Protocol::Smtp);
        let verdict = classify(
            &err,
            &rules(),
            ClassifyContext {
                deferred_count: 1,
                ..ctx()
            },
            Some(&[60_000, 120_000]),
        );
        assert_eq!(verdict.ttl, Some(Duration::from_millis(120_000)));

        let verdict = classify(
            &err,
            &rules(),
            ClassifyContext {
                deferred_count: 2,
                ..ctx()
            },
            Some(&[60_000, 120_000]),
        );
        assert_eq!(verdict.action, Action::Reject);
    }

    #[test]
    fn first_matching_rule_wins() {
        let err = DeliveryError::smtp(
            "550 5.7.1 Service unavailable; client blocked using spamhaus",
            Protocol::Smtp,
        );
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Reject);
        assert_eq!(verdict.category, "blacklist");
    }

    #[test]
    fn unparseable_response_is_a_network_defer() {
        let err = DeliveryError::smtp("connection reset by peer", Protocol::Smtp);
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Defer);
        assert_eq!(verdict.category, category::NETWORK);
    }

    #[test]
    fn preset_policy_category_rejects_when_permanent() {
        let err = DeliveryError::policy("MX does not match MTA-STS policy");
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Reject);
        assert_eq!(verdict.category, category::POLICY);
    }

    #[test]
    fn http_code_splits_reject_and_defer() {
        let err = DeliveryError::http(404, "sink returned 404");
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Reject);
        assert_eq!(verdict.category, category::HTTP);

        let err = DeliveryError::http(503, "sink returned 503");
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Defer);
    }

    #[test]
    fn blacklist_with_exhausted_pool_rejects() {
        let err = DeliveryError::smtp("554 client host blocked using spamhaus", Protocol::Smtp);
        let verdict = classify(
            &err,
            &rules(),
            ClassifyContext {
                pool_disabled: true,
                ..ctx()
            },
            None,
        );
        assert_eq!(verdict.action, Action::Reject);

        // a bounce of a bounce never defers either
        let verdict = classify(
            &err,
            &rules(),
            ClassifyContext {
                envelope_from_empty: true,
                ..ctx()
            },
            None,
        );
        assert_eq!(verdict.action, Action::Reject);
    }

    #[test]
    fn explicit_action_overrides_classification() {
        let mut err = DeliveryError::smtp("550 user unknown", Protocol::Smtp);
        err.action = Some(Action::Defer);
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Defer);
    }

    #[test]
    fn plugin_errors_stay_plugin_and_defer() {
        let err = DeliveryError::plugin("hook refused the delivery for now");
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Defer);
        assert_eq!(verdict.category, category::PLUGIN);

        let mut err = DeliveryError::plugin("hook rejected the delivery");
        err.action = Some(Action::Reject);
        let verdict = classify(&err, &rules(), ctx(), None);
        assert_eq!(verdict.action, Action::Reject);
    }

    #[test]
    fn classifier_is_pure() {
        let err = DeliveryError::smtp("452 4.2.2 mailbox full", Protocol::Smtp);
        let one = classify(&err, &rules(), ctx(), None);
        let two = classify(&err, &rules(), ctx(), None);
        assert_eq!(one, two);
        assert_eq!(one.category, "quota");
    }

    #[test]
    fn rule_file_parsing_rejects_bad_lines() {
        assert!(BounceRules::parse("foo,defer,cat,msg").is_ok());
        assert!(BounceRules::parse("foo,bad-action,cat,msg").is_err());
        assert!(BounceRules::parse("# comment only\n\n").unwrap().is_empty());
        let rules = BounceRules::parse("a,reject,x,one, with, commas").unwrap();
        assert_eq!(rules[0].message, "one, with, commas");
        assert_eq!(rules[0].line, 1);
    }
}
