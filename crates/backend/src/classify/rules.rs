//! Stage A: deterministic classification rules.
//!
//! Evaluated in strict precedence order, first match wins. Pure function of
//! the message features; the LLM oracle never runs before this does.

use super::MessageFeatures;
use crate::mail::address_domain;
use shared_types::Category;

/// Outcome of the deterministic stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleVerdict {
    pub category: Category,
    pub confidence: f32,
    pub rule: &'static str,
}

/// Domains of legitimate service providers whose mail is never spam and
/// never deal flow, whatever the body says.
const LEGIT_PROVIDER_DOMAINS: &[&str] = &[
    "accounts.google.com",
    "google.com",
    "stripe.com",
    "github.com",
    "linkedin.com",
    "docusign.net",
    "intuit.com",
    "zoom.us",
    "calendly.com",
    "microsoft.com",
    "apple.com",
    "amazonaws.com",
    "brex.com",
    "mercury.com",
    "carta.com",
    "gusto.com",
    "ramp.com",
];

const THREAT_PHRASES: &[&str] = &[
    "verify your account",
    "confirm your identity",
    "your password will expire",
    "unusual sign-in activity",
    "account has been suspended",
    "account will be closed",
    "click here to restore",
    "update your payment information",
    "wire transfer request",
];

const SUSPICIOUS_TLDS: &[&str] = &[
    ".xyz", ".top", ".click", ".loan", ".work", ".zip", ".country", ".gq", ".tk",
];

const URGENCY_PHRASES: &[&str] = &[
    "urgent",
    "immediately",
    "act now",
    "within 24 hours",
    "final notice",
];

const MALICIOUS_EXTENSIONS: &[&str] = &[
    ".exe", ".scr", ".vbs", ".js", ".bat", ".cmd", ".iso", ".jar",
];

const NEWSLETTER_SENDER_MARKERS: &[&str] = &[
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "newsletter",
    "notifications@",
    "notification@",
    "updates@",
    "digest@",
    "marketing@",
    "mailer",
    "automated",
];

const NETWORKING_PATTERNS: &[&str] = &[
    "grab coffee",
    "coffee chat",
    "pick your brain",
    "would love to connect",
    "love to meet",
    "get your advice",
    "your advice on",
    "catch up soon",
    "catch up over",
    "intro call",
    "quick call",
    "office hours",
];

const WARM_INTRO_PHRASES: &[&str] = &[
    "wanted to introduce",
    "i'd like to introduce",
    "id like to introduce",
    "want to introduce you",
    "introducing you to",
    "intro to the founder",
    "connecting you with",
    "worth a look",
    "putting you in touch",
];

const STARTUP_CONTEXT_WORDS: &[&str] = &[
    "founder",
    "startup",
    "their company",
    "they're building",
    "they are building",
    "raising",
    "their round",
];

const FUNDRAISING_KEYWORDS: &[&str] = &[
    "raising",
    "fundraise",
    "fundraising",
    "pre-seed",
    "preseed",
    "seed round",
    "series a",
    "series b",
    "term sheet",
    "cap table",
    "safe note",
    "pitch deck",
    "our deck",
    "deck attached",
    "lead investor",
    "oversubscribed",
    "pre-money",
    "post-money",
    "valuation cap",
];

const DECK_HOST_DOMAINS: &[&str] = &[
    "docsend.com",
    "pitch.com",
    "papermark.io",
    "brieflink.com",
    "attach.io",
    "deckdeckgo.com",
];

const HIRING_KEYWORDS: &[&str] = &[
    "job description",
    "open role",
    "job opening",
    "we're hiring",
    "we are hiring",
    "candidate",
    "resume attached",
    "cv attached",
    "recruiter",
    "headcount",
    "interview loop",
    "offer letter",
    "applying for",
];

const FOLLOWUP_PHRASES: &[&str] = &[
    "as discussed",
    "next steps",
    "following up",
    "circling back",
    "per our conversation",
];

const INVESTMENT_CONTEXT_WORDS: &[&str] = &[
    "investment",
    "investors",
    "the round",
    "our round",
    "diligence",
    "allocation",
    "term sheet",
    "wire details",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn is_legit_provider(sender_address: &str) -> bool {
    let domain = address_domain(sender_address);
    if domain.is_empty() {
        return false;
    }
    LEGIT_PROVIDER_DOMAINS
        .iter()
        .any(|d| domain == *d || domain.ends_with(&format!(".{d}")))
}

fn is_security_threat(f: &MessageFeatures, text: &str) -> bool {
    if contains_any(text, THREAT_PHRASES) {
        return true;
    }

    let domain = address_domain(&f.sender_address);
    let suspicious_tld = SUSPICIOUS_TLDS.iter().any(|tld| domain.ends_with(tld));
    if suspicious_tld && contains_any(text, URGENCY_PHRASES) {
        return true;
    }

    f.attachment_filenames.iter().any(|name| {
        let lower = name.to_lowercase();
        MALICIOUS_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    })
}

fn looks_automated(f: &MessageFeatures) -> bool {
    let sender = f.sender_address.to_lowercase();
    if contains_any(&sender, NEWSLETTER_SENDER_MARKERS) {
        return true;
    }

    f.headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("list-unsubscribe")
            || (name.eq_ignore_ascii_case("precedence")
                && (value.eq_ignore_ascii_case("bulk") || value.eq_ignore_ascii_case("list")))
    })
}

fn is_warm_intro(text: &str) -> bool {
    contains_any(text, WARM_INTRO_PHRASES) && contains_any(text, STARTUP_CONTEXT_WORDS)
}

fn has_deck_link(links: &[String]) -> bool {
    links.iter().any(|link| {
        let lower = link.to_lowercase();
        DECK_HOST_DOMAINS.iter().any(|host| lower.contains(host))
    })
}

fn has_fundraising_signal(f: &MessageFeatures, text: &str) -> bool {
    f.has_pdf_attachment || contains_any(text, FUNDRAISING_KEYWORDS) || has_deck_link(&f.links)
}

/// Run the deterministic rules in precedence order.
pub fn evaluate(f: &MessageFeatures) -> RuleVerdict {
    let mut text = format!("{} {}", f.subject, f.body).to_lowercase();
    if let Some(extra) = &f.attachment_text {
        text.push(' ');
        text.push_str(&extra.to_lowercase());
    }

    // 1. Known legitimate provider outranks everything, including the
    //    security heuristics ("verify your account" from Google is real).
    if is_legit_provider(&f.sender_address) {
        return RuleVerdict {
            category: Category::General,
            confidence: 0.98,
            rule: "legit-provider",
        };
    }

    // 2. Security threat heuristics.
    if is_security_threat(f, &text) {
        return RuleVerdict {
            category: Category::Spam,
            confidence: 0.98,
            rule: "security-threat",
        };
    }

    // 3. Newsletters and automated senders.
    if looks_automated(f) {
        return RuleVerdict {
            category: Category::General,
            confidence: 0.95,
            rule: "automated-sender",
        };
    }

    // 4. Networking requests, unless it is a warm intro about a startup.
    if contains_any(&text, NETWORKING_PATTERNS) && !is_warm_intro(&text) {
        return RuleVerdict {
            category: Category::Networking,
            confidence: 0.85,
            rule: "networking-request",
        };
    }

    // 5. Deal-flow signals, strongest first.
    if f.has_pdf_attachment {
        return RuleVerdict {
            category: Category::DealFlow,
            confidence: 0.95,
            rule: "pdf-deck",
        };
    }
    if contains_any(&text, FUNDRAISING_KEYWORDS) || has_deck_link(&f.links) {
        return RuleVerdict {
            category: Category::DealFlow,
            confidence: 0.90,
            rule: "fundraising-signal",
        };
    }
    if is_warm_intro(&text) {
        return RuleVerdict {
            category: Category::DealFlow,
            confidence: 0.88,
            rule: "warm-intro",
        };
    }

    // 6. Hiring, only without any fundraising signal.
    if contains_any(&text, HIRING_KEYWORDS) && !has_fundraising_signal(f, &text) {
        return RuleVerdict {
            category: Category::Hiring,
            confidence: 0.80,
            rule: "hiring-keywords",
        };
    }

    // 7. Follow-up phrasing in an investment context; low confidence,
    //    deferred to the oracle.
    if contains_any(&text, FOLLOWUP_PHRASES) && contains_any(&text, INVESTMENT_CONTEXT_WORDS) {
        return RuleVerdict {
            category: Category::DealFlow,
            confidence: 0.65,
            rule: "followup-context",
        };
    }

    RuleVerdict {
        category: Category::Networking,
        confidence: 0.60,
        rule: "default",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn legit_provider_outranks_threat_heuristics() {
        let f = features(
            "noreply@accounts.google.com",
            "verify your account",
            "Please verify your account to continue.",
        );
        let v = evaluate(&f);
        assert_eq!(v.category, Category::General);
        assert_eq!(v.rule, "legit-provider");
        assert_eq!(v.confidence, 0.98);
    }

    #[test]
    fn credential_harvest_is_spam() {
        let f = features(
            "security@paypa1-alerts.xyz",
            "Action required",
            "Your account has been suspended, verify your account immediately.",
        );
        let v = evaluate(&f);
        assert_eq!(v.category, Category::Spam);
        assert_eq!(v.confidence, 0.98);
    }

    #[test]
    fn suspicious_tld_needs_urgency() {
        let calm = features("hello@startup.xyz", "Our seed round", "We are raising.");
        assert_eq!(evaluate(&calm).category, Category::DealFlow);

        let urgent = features(
            "hello@lottery.xyz",
            "act now",
            "Claim your prize immediately, final notice.",
        );
        assert_eq!(evaluate(&urgent).category, Category::Spam);
    }

    #[test]
    fn malicious_attachment_is_spam() {
        let mut f = features("someone@random.com", "invoice", "see attached");
        f.attachment_filenames.push("invoice.pdf.exe".to_string());
        assert_eq!(evaluate(&f).category, Category::Spam);
    }

    #[test]
    fn newsletter_sender_is_general() {
        let f = features("newsletter@techdigest.com", "This week in tech", "...");
        let v = evaluate(&f);
        assert_eq!(v.category, Category::General);
        assert_eq!(v.confidence, 0.95);
    }

    #[test]
    fn list_unsubscribe_header_is_general() {
        let mut f = features("updates-team@somecompany.com", "Product news", "...");
        f.sender_address = "team@somecompany.com".to_string();
        f.headers.push((
            "List-Unsubscribe".to_string(),
            "<mailto:unsub@somecompany.com>".to_string(),
        ));
        assert_eq!(evaluate(&f).category, Category::General);
    }

    #[test]
    fn coffee_request_is_networking() {
        let f = features(
            "mba.student@school.edu",
            "Quick question",
            "Would love to grab coffee and pick your brain about venture.",
        );
        let v = evaluate(&f);
        assert_eq!(v.category, Category::Networking);
        assert_eq!(v.confidence, 0.85);
    }

    #[test]
    fn warm_intro_beats_networking_rule() {
        let f = features(
            "friend@otherfund.com",
            "Intro",
            "I wanted to introduce you to the founder of Acme, they're building robots and raising.",
        );
        let v = evaluate(&f);
        assert_eq!(v.category, Category::DealFlow);
        assert_eq!(v.confidence, 0.88);
        assert_eq!(v.rule, "warm-intro");
    }

    #[test]
    fn pdf_deck_is_strongest_deal_signal() {
        let mut f = features("founder@startup.io", "Acme", "Sharing our materials.");
        f.has_pdf_attachment = true;
        let v = evaluate(&f);
        assert_eq!(v.category, Category::DealFlow);
        assert_eq!(v.confidence, 0.95);
    }

    #[test]
    fn deck_link_is_deal_flow() {
        let mut f = features("founder@startup.io", "Acme", "Here it is.");
        f.links.push("https://docsend.com/view/abc123".to_string());
        let v = evaluate(&f);
        assert_eq!(v.category, Category::DealFlow);
        assert_eq!(v.confidence, 0.90);
    }

    #[test]
    fn hiring_without_fundraising_signal() {
        let f = features(
            "recruiter@agency.com",
            "Open role: Head of Platform",
            "We have a candidate pipeline and a job description ready.",
        );
        let v = evaluate(&f);
        assert_eq!(v.category, Category::Hiring);
        assert_eq!(v.confidence, 0.80);
    }

    #[test]
    fn hiring_with_fundraising_is_deal_flow() {
        let f = features(
            "founder@startup.io",
            "Hiring and raising",
            "We're hiring a candidate for sales while raising our seed round.",
        );
        assert_eq!(evaluate(&f).category, Category::DealFlow);
    }

    #[test]
    fn followup_in_investment_context_is_low_confidence_deal_flow() {
        let f = features(
            "founder@startup.io",
            "Re: meeting",
            "As discussed, next steps on the round and diligence.",
        );
        let v = evaluate(&f);
        assert_eq!(v.category, Category::DealFlow);
        assert_eq!(v.confidence, 0.65);
        assert_eq!(v.rule, "followup-context");
    }

    #[test]
    fn default_is_networking_at_low_confidence() {
        let f = features("someone@example.com", "hello", "just saying hi");
        let v = evaluate(&f);
        assert_eq!(v.category, Category::Networking);
        assert_eq!(v.confidence, 0.60);
        assert_eq!(v.rule, "default");
    }

    #[test]
    fn determinism_for_fixed_input() {
        let f = features(
            "founder@startup.io",
            "Seed round",
            "We are raising a seed round.",
        );
        let first = evaluate(&f);
        for _ in 0..10 {
            assert_eq!(evaluate(&f), first);
        }
    }
}
