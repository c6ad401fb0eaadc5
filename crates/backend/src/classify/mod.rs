//! Two-stage classification engine.
//!
//! Stage A is the deterministic rule table in [`rules`]; stage B asks the
//! LLM oracle for a second opinion. [`resolve`] arbitrates between the two,
//! and an oracle outage degrades to the deterministic verdict instead of
//! stalling the pipeline.

pub mod oracle;
pub mod rules;

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use shared_types::{Category, Classification, OracleLabel, OracleRequest, OracleResponse};

use crate::attachments::truncate_chars;
use crate::mail::{parse_from_header, FetchedMessage};

use oracle::ClassificationOracle;
use rules::RuleVerdict;

/// Above this, the deterministic verdict stands even when the oracle
/// disagrees (unless the oracle says spam).
const STAGE_A_AUTHORITATIVE: f32 = 0.95;
/// Deal-flow signals below this are weak enough to arbitrate, but an
/// oracle disagreement still keeps the deal-flow label.
const DEAL_FLOW_BIAS_BELOW: f32 = 0.80;
const FORCED_DEAL_FLOW_CONFIDENCE: f32 = 0.85;
const ORACLE_FALLBACK_CONFIDENCE: f32 = 0.70;

const ORACLE_BODY_MAX_CHARS: usize = 4_000;
const ORACLE_HEADER_CAP: usize = 10;
const LINK_CAP: usize = 20;

/// Everything the classifier looks at, extracted once per message.
#[derive(Debug, Clone)]
pub struct MessageFeatures {
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub sender_address: String,
    pub headers: Vec<(String, String)>,
    pub links: Vec<String>,
    pub attachment_filenames: Vec<String>,
    pub has_pdf_attachment: bool,
    pub attachment_text: Option<String>,
}

/// Build classifier features from a fetched message plus any attachment
/// text the extractor produced.
pub fn build_features(msg: &FetchedMessage, attachment_text: Option<String>) -> MessageFeatures {
    let (sender_address, _) = parse_from_header(&msg.from);
    let body = msg
        .body_text
        .clone()
        .unwrap_or_else(|| msg.snippet.clone());

    let mut link_source = format!("{} {}", msg.subject, body);
    if let Some(extra) = &attachment_text {
        link_source.push(' ');
        link_source.push_str(extra);
    }

    MessageFeatures {
        subject: msg.subject.clone(),
        body,
        sender: msg.from.clone(),
        sender_address,
        headers: msg.headers.clone(),
        links: extract_links(&link_source),
        attachment_filenames: msg.attachments.iter().map(|a| a.filename.clone()).collect(),
        has_pdf_attachment: msg.has_pdf_attachment(),
        attachment_text,
    }
}

/// Pull http(s) URLs out of the text, deduplicated, capped at [`LINK_CAP`].
pub fn extract_links(text: &str) -> Vec<String> {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    let re = URL_RE.get_or_init(|| {
        Regex::new(r#"https?://[^\s<>()"']+"#).unwrap()
    });

    let mut links = Vec::new();
    for m in re.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ';']).to_string();
        if !links.contains(&url) {
            links.push(url);
            if links.len() >= LINK_CAP {
                break;
            }
        }
    }
    links
}

fn oracle_request(features: &MessageFeatures, deterministic: Category) -> OracleRequest {
    OracleRequest {
        subject: features.subject.clone(),
        body: truncate_chars(&features.body, ORACLE_BODY_MAX_CHARS),
        sender: features.sender.clone(),
        headers: features
            .headers
            .iter()
            .take(ORACLE_HEADER_CAP)
            .cloned()
            .collect(),
        links: features.links.clone(),
        has_pdf_attachment: features.has_pdf_attachment,
        deterministic_category: deterministic,
    }
}

/// Arbitrate between the deterministic verdict and the oracle's answer.
///
/// Precedence, in order: an oracle spam call always wins; an authoritative
/// deterministic verdict stands; agreement adopts the oracle's confidence;
/// a weak deal-flow signal survives oracle disagreement at a fixed
/// confidence, since missing a live deal costs more than a false positive;
/// otherwise the oracle wins outright.
pub fn resolve(rule: RuleVerdict, oracle: Option<&OracleResponse>) -> (Category, f32) {
    let Some(oracle) = oracle else {
        let confidence = if rule.confidence >= STAGE_A_AUTHORITATIVE {
            rule.confidence
        } else {
            ORACLE_FALLBACK_CONFIDENCE
        };
        return (rule.category, confidence);
    };

    if oracle.label == OracleLabel::Spam {
        return (Category::Spam, oracle.confidence);
    }

    if rule.confidence >= STAGE_A_AUTHORITATIVE {
        return (rule.category, rule.confidence);
    }

    let oracle_category = oracle.label.to_category();
    if oracle_category == rule.category {
        return (rule.category, oracle.confidence);
    }

    if rule.category == Category::DealFlow && rule.confidence < DEAL_FLOW_BIAS_BELOW {
        return (Category::DealFlow, FORCED_DEAL_FLOW_CONFIDENCE);
    }

    (oracle_category, oracle.confidence)
}

/// Final output of the two-stage engine. `oracle_answered` is false when
/// the verdict fell back to stage A alone; such messages stay unprocessed
/// so the backlog workers retry them once the oracle recovers.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub classification: Classification,
    pub oracle_answered: bool,
}

/// The full two-stage classifier.
pub struct Classifier {
    oracle: Arc<dyn ClassificationOracle>,
}

impl Classifier {
    pub fn new(oracle: Arc<dyn ClassificationOracle>) -> Self {
        Self { oracle }
    }

    /// Classify one message. Infallible by construction: every failure mode
    /// collapses into the deterministic verdict.
    pub async fn classify(&self, features: &MessageFeatures) -> Verdict {
        let verdict = rules::evaluate(features);
        debug!(
            rule = verdict.rule,
            category = verdict.category.as_str(),
            confidence = verdict.confidence,
            "deterministic verdict"
        );

        let request = oracle_request(features, verdict.category);
        let oracle_response = match self.oracle.classify(&request).await {
            Ok(response) => Some(response),
            Err(err) => {
                warn!(error = %err, "oracle unavailable, keeping deterministic verdict");
                None
            }
        };

        let oracle_answered = oracle_response.is_some();
        let (category, confidence) = resolve(verdict, oracle_response.as_ref());
        Verdict {
            classification: Classification::new(category, confidence, features.links.clone()),
            oracle_answered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oracle::OracleError;

    struct MockOracle {
        response: Result<OracleResponse, &'static str>,
    }

    impl MockOracle {
        fn answering(label: OracleLabel, confidence: f32) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(OracleResponse {
                    label,
                    confidence,
                    rationale: "test".to_string(),
                    signals: Vec::new(),
                }),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                response: Err("down"),
            })
        }
    }

    #[async_trait]
    impl ClassificationOracle for MockOracle {
        async fn classify(&self, _request: &OracleRequest) -> Result<OracleResponse, OracleError> {
            self.response
                .clone()
                .map_err(|e| OracleError::Unavailable(e.to_string()))
        }
    }

    fn features(sender_address: &str, subject: &str, body: &str) -> MessageFeatures {
        MessageFeatures {
            subject: subject.to_string(),
            body: body.to_string(),
            sender: sender_address.to_string(),
            sender_address: sender_address.to_string(),
            headers: Vec::new(),
            links: Vec::new(),
            attachment_filenames: Vec::new(),
            has_pdf_attachment: false,
            attachment_text: None,
        }
    }

    #[tokio::test]
    async fn oracle_spam_overrides_authoritative_rule() {
        let classifier = Classifier::new(MockOracle::answering(OracleLabel::Spam, 0.97));
        let mut f = features("founder@startup.io", "Our deck", "raising a seed round");
        f.has_pdf_attachment = true;
        let c = classifier.classify(&f).await.classification;
        assert_eq!(c.category, Category::Spam);
        assert_eq!(c.confidence, 0.97);
    }

    #[tokio::test]
    async fn authoritative_rule_beats_non_spam_oracle() {
        let classifier = Classifier::new(MockOracle::answering(OracleLabel::Networking, 0.9));
        let mut f = features("founder@startup.io", "Our deck", "materials attached");
        f.has_pdf_attachment = true;
        let c = classifier.classify(&f).await.classification;
        assert_eq!(c.category, Category::DealFlow);
        assert_eq!(c.confidence, 0.95);
    }

    #[tokio::test]
    async fn agreement_adopts_oracle_confidence() {
        let classifier = Classifier::new(MockOracle::answering(OracleLabel::Dealflow, 0.93));
        let f = features(
            "founder@startup.io",
            "Seed round",
            "we are raising our seed round",
        );
        let c = classifier.classify(&f).await.classification;
        assert_eq!(c.category, Category::DealFlow);
        assert_eq!(c.confidence, 0.93);
    }

    #[tokio::test]
    async fn weak_deal_flow_survives_oracle_disagreement() {
        let classifier = Classifier::new(MockOracle::answering(OracleLabel::Networking, 0.9));
        let f = features(
            "founder@startup.io",
            "Re: meeting",
            "as discussed, next steps on the round",
        );
        let c = classifier.classify(&f).await.classification;
        assert_eq!(c.category, Category::DealFlow);
        assert_eq!(c.confidence, 0.85);
    }

    #[tokio::test]
    async fn oracle_wins_ordinary_disagreements() {
        let classifier = Classifier::new(MockOracle::answering(OracleLabel::Hiring, 0.88));
        let f = features("someone@example.com", "hello", "just saying hi");
        let c = classifier.classify(&f).await.classification;
        assert_eq!(c.category, Category::Hiring);
        assert_eq!(c.confidence, 0.88);
    }

    #[tokio::test]
    async fn oracle_outage_falls_back_to_rule_verdict() {
        let classifier = Classifier::new(MockOracle::failing());
        let f = features(
            "founder@startup.io",
            "Seed round",
            "we are raising our seed round",
        );
        let v = classifier.classify(&f).await;
        assert!(!v.oracle_answered);
        let c = v.classification;
        assert_eq!(c.category, Category::DealFlow);
        assert_eq!(c.confidence, 0.70);
        assert_eq!(c.tags, vec!["deal-flow".to_string()]);
    }

    #[tokio::test]
    async fn oracle_outage_keeps_authoritative_confidence() {
        let classifier = Classifier::new(MockOracle::failing());
        let f = features("noreply@accounts.google.com", "verify your account", "...");
        let c = classifier.classify(&f).await.classification;
        assert_eq!(c.category, Category::General);
        assert_eq!(c.confidence, 0.98);
    }

    #[test]
    fn links_are_extracted_deduplicated_and_capped() {
        let text = "see https://docsend.com/view/abc and https://docsend.com/view/abc again, plus https://example.com/page.";
        let links = extract_links(text);
        assert_eq!(
            links,
            vec![
                "https://docsend.com/view/abc".to_string(),
                "https://example.com/page".to_string(),
            ]
        );

        let many: String = (0..40)
            .map(|i| format!("https://host{i}.com "))
            .collect();
        assert_eq!(extract_links(&many).len(), 20);
    }
}
