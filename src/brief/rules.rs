//! Deterministic keyword extractor used when every provider has failed.

use regex::Regex;
use std::sync::OnceLock;

use super::{Filters, FinancialProfile, MissionBrief, Offering, TargetPersona};

pub const ACTION_SEARCH_LAYOFF_EVENTS: &str = "SEARCH_LAYOFF_EVENTS";
pub const ACTION_PROSPECT_CONTACTS: &str = "PROSPECT_CONTACTS";
pub const ACTION_ENRICH_CONTACTS: &str = "ENRICH_CONTACTS";

const LAYOFF_TERMS: &[&str] = &[
    "layoff",
    "laid off",
    "laid-off",
    "warn notice",
    "warn act",
    "downsiz",
    "let go",
    "job cuts",
];

const ENRICH_TERMS: &[&str] = &[
    "enrich",
    "contact details",
    "contact info",
    "sales navigator",
    "salesnav",
];

const PROSPECT_TERMS: &[&str] = &[
    "find", "prospect", "lead", "contacts", "people", "customers", "audience",
];

/// (pattern, canonical industry)
const INDUSTRIES: &[(&str, &str)] = &[
    (r"\b(tech|technology|software|saas)\b", "Technology"),
    (r"\b(healthcare|health care|hospitals?|medical)\b", "Healthcare"),
    (r"\b(finance|financial services|banks?|banking|fintech)\b", "Financial Services"),
    (r"\b(retail|e-?commerce)\b", "Retail"),
    (r"\b(manufacturing|factory|factories)\b", "Manufacturing"),
    (r"\b(logistics|warehouses?|shipping)\b", "Logistics"),
    (r"\b(education|schools?|universit(y|ies))\b", "Education"),
    (r"\b(media|entertainment|gaming)\b", "Media & Entertainment"),
];

const STATES: &[&str] = &[
    "Alabama", "Alaska", "Arizona", "Arkansas", "California", "Colorado", "Connecticut",
    "Delaware", "Florida", "Georgia", "Hawaii", "Idaho", "Illinois", "Indiana", "Iowa",
    "Kansas", "Kentucky", "Louisiana", "Maine", "Maryland", "Massachusetts", "Michigan",
    "Minnesota", "Mississippi", "Missouri", "Montana", "Nebraska", "Nevada", "New Hampshire",
    "New Jersey", "New Mexico", "New York", "North Carolina", "North Dakota", "Ohio",
    "Oklahoma", "Oregon", "Pennsylvania", "Rhode Island", "South Carolina", "South Dakota",
    "Tennessee", "Texas", "Utah", "Vermont", "Virginia", "Washington", "West Virginia",
    "Wisconsin", "Wyoming",
];

/// Upper-case abbreviations matched case-sensitively so "in" or "or" never match.
const STATE_CODES: &[(&str, &str)] = &[
    ("CA", "California"),
    ("NY", "New York"),
    ("TX", "Texas"),
    ("WA", "Washington"),
    ("FL", "Florida"),
    ("IL", "Illinois"),
    ("MA", "Massachusetts"),
    ("NJ", "New Jersey"),
    ("GA", "Georgia"),
    ("CO", "Colorado"),
];

fn role_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(software engineer|product manager|data scientist|engineer|developer|designer|manager|executive|nurse|teacher|recruiter|salesperson)s?\b",
        )
        .expect("role pattern is valid")
    })
}

fn relative_window_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:last|past|previous)\s+(\d{1,3})\s+(day|week|month)s?\b")
            .expect("window pattern is valid")
    })
}

fn salary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?:making|earning|earn|salary|income)(?:\s+of)?(?:\s+at\s+least|\s+over|\s+above|\s+more\s+than)?\s+\$?(\d+(?:,\d{3})*)(k)?\b",
        )
        .expect("salary pattern is valid")
    })
}

fn offering_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?:offer|offering|sell|selling|pitch|pitching|promote|promoting)\s+(?:them\s+)?((?:an?\s+|our\s+)?[a-z0-9][a-z0-9 \-]*?)(?:\s+to\b|[.,;!]|$)",
        )
        .expect("offering pattern is valid")
    })
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn word_regex(word: &str) -> Regex {
    Regex::new(&format!(r"\b{}\b", regex::escape(word))).expect("escaped word is a valid pattern")
}

fn industry_regexes() -> &'static [(Regex, &'static str)] {
    static RE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RE.get_or_init(|| {
        INDUSTRIES
            .iter()
            .map(|(pattern, name)| (Regex::new(pattern).expect("industry pattern is valid"), *name))
            .collect()
    })
}

/// Lower-cased state names, longest first so "West Virginia" wins over "Virginia".
fn state_regexes() -> &'static [(Regex, &'static str)] {
    static RE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RE.get_or_init(|| {
        let mut states: Vec<&'static str> = STATES.to_vec();
        states.sort_by_key(|s| std::cmp::Reverse(s.len()));
        states
            .into_iter()
            .map(|state| (word_regex(&state.to_lowercase()), state))
            .collect()
    })
}

fn state_code_regexes() -> &'static [(Regex, &'static str)] {
    static RE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RE.get_or_init(|| {
        STATE_CODES
            .iter()
            .map(|(code, name)| (word_regex(code), *name))
            .collect()
    })
}

fn detect_action(lower: &str) -> Option<&'static str> {
    if contains_any(lower, LAYOFF_TERMS) {
        Some(ACTION_SEARCH_LAYOFF_EVENTS)
    } else if contains_any(lower, ENRICH_TERMS) {
        Some(ACTION_ENRICH_CONTACTS)
    } else if contains_any(lower, PROSPECT_TERMS) || role_regex().is_match(lower) {
        Some(ACTION_PROSPECT_CONTACTS)
    } else {
        None
    }
}

fn detect_industry(lower: &str) -> Option<String> {
    industry_regexes()
        .iter()
        .find(|(re, _)| re.is_match(lower))
        .map(|(_, name)| name.to_string())
}

fn detect_location(prompt: &str, lower: &str) -> Option<String> {
    let by_name = state_regexes().iter().find(|(re, _)| re.is_match(lower));
    by_name
        .or_else(|| state_code_regexes().iter().find(|(re, _)| re.is_match(prompt)))
        .map(|(_, name)| name.to_string())
}

fn window(days: u32) -> String {
    if days == 1 {
        "past_1_day".to_string()
    } else {
        format!("past_{}_days", days)
    }
}

fn detect_date_range(lower: &str) -> Option<String> {
    if let Some(caps) = relative_window_regex().captures(lower) {
        let count: u32 = caps[1].parse().ok()?;
        let unit = match &caps[2] {
            "week" => 7,
            "month" => 30,
            _ => 1,
        };
        return Some(window(count.saturating_mul(unit)));
    }
    let phrases: &[(&[&str], u32)] = &[
        (&["today", "yesterday", "last 24 hours"], 1),
        (&["last week", "past week", "this week"], 7),
        (&["last quarter", "past quarter", "this quarter"], 90),
        (&["last year", "past year", "this year"], 365),
        (
            &["last month", "past month", "this month", "recent", "newly"],
            30,
        ),
    ];
    phrases
        .iter()
        .find(|(terms, _)| contains_any(lower, terms))
        .map(|(_, days)| window(*days))
}

fn detect_financial_profile(lower: &str) -> Option<FinancialProfile> {
    let mut profile = FinancialProfile::default();
    if lower.contains("401k") || lower.contains("401(k)") {
        profile.has.push("401k".to_string());
    }
    if lower.contains("retirement") {
        profile.has.push("retirement funds".to_string());
    }
    if lower.contains("pension") {
        profile.has.push("pension".to_string());
    }
    if let Some(caps) = salary_regex().captures(lower) {
        let digits = caps[1].replace(',', "");
        if let Ok(amount) = digits.parse::<u64>() {
            let multiplier = if caps.get(2).is_some() { 1000 } else { 1 };
            profile.min_salary = Some(amount.saturating_mul(multiplier));
        }
    }
    if lower.contains("invest") {
        profile.interest_in = Some("investment products".to_string());
    }
    (!profile.is_empty()).then_some(profile)
}

fn detect_offering(lower: &str) -> Option<Offering> {
    let product = offering_regex()
        .captures(lower)
        .map(|caps| caps[1].trim().to_string())
        .filter(|p| !p.is_empty());
    let category = if contains_any(lower, &["insurance", "annuit"]) {
        Some("insurance")
    } else if contains_any(lower, &["invest", "wealth", "rollover"]) {
        Some("investment")
    } else if contains_any(lower, &["recruit", "staffing", "job placement"]) {
        Some("recruiting")
    } else {
        None
    };
    if product.is_none() && category.is_none() {
        return None;
    }
    Some(Offering {
        product,
        category: category.map(|c| c.to_string()),
    })
}

fn detect_roles(lower: &str) -> Vec<String> {
    let mut roles: Vec<String> = Vec::new();
    for caps in role_regex().captures_iter(lower) {
        let role = caps[1].to_string();
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    roles
}

fn describe_persona(action: Option<&str>, roles: &[String], industry: Option<&str>) -> Option<String> {
    if action == Some(ACTION_SEARCH_LAYOFF_EVENTS) {
        let subject = if roles.is_empty() {
            "employees".to_string()
        } else {
            format!("{}s", roles.join("s and "))
        };
        return Some(match industry {
            Some(industry) => format!("Recently laid-off {} {}", industry, subject),
            None => format!("Recently laid-off {}", subject),
        });
    }
    match (roles.is_empty(), industry) {
        (false, Some(industry)) => Some(format!("{}s in {}", roles.join("s and "), industry)),
        (false, None) => Some(format!("{}s", roles.join("s and "))),
        (true, Some(industry)) => Some(format!("{} professionals", industry)),
        (true, None) => None,
    }
}

/// Build a brief from keyword rules. Always succeeds; fields it cannot infer stay empty.
pub fn extract(prompt: &str) -> MissionBrief {
    let lower = prompt.to_lowercase();
    let action = detect_action(&lower);
    let industry = detect_industry(&lower);
    let roles = detect_roles(&lower);

    let mut keywords = roles.clone();
    if action == Some(ACTION_SEARCH_LAYOFF_EVENTS) {
        keywords.push("laid off".to_string());
        keywords.push("former employee".to_string());
    }

    MissionBrief {
        action: action.map(|a| a.to_string()),
        target_persona: TargetPersona {
            description: describe_persona(action, &roles, industry.as_deref()),
            keywords,
        },
        filters: Filters {
            industry,
            location: detect_location(prompt, &lower),
            date_range: detect_date_range(&lower),
            financial_profile: detect_financial_profile(&lower),
        },
        offering: detect_offering(&lower),
        raw_prompt: prompt.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_tables_are_built_once() {
        assert!(std::ptr::eq(state_regexes(), state_regexes()));
        assert!(std::ptr::eq(industry_regexes(), industry_regexes()));
        assert_eq!(state_regexes().len(), STATES.len());
        assert_eq!(
            detect_location("Layoffs in West Virginia", "layoffs in west virginia").as_deref(),
            Some("West Virginia")
        );
        assert_eq!(
            detect_location("nurses in NY", "nurses in ny").as_deref(),
            Some("New York")
        );
        assert_eq!(detect_industry("hospital layoffs").as_deref(), Some("Healthcare"));
    }

    #[test]
    fn test_layoff_prompt() {
        let brief = extract("tech layoffs in california last month");
        assert_eq!(brief.action.as_deref(), Some(ACTION_SEARCH_LAYOFF_EVENTS));
        assert_eq!(brief.filters.industry.as_deref(), Some("Technology"));
        assert_eq!(brief.filters.location.as_deref(), Some("California"));
        assert_eq!(brief.filters.date_range.as_deref(), Some("past_30_days"));
        assert_eq!(
            brief.target_persona.description.as_deref(),
            Some("Recently laid-off Technology employees")
        );
        assert_eq!(brief.raw_prompt, "tech layoffs in california last month");
    }

    #[test]
    fn test_salary_and_assets() {
        let brief =
            extract("find newly laid off tech in california making at least 65k with a 401k");
        let profile = brief.filters.financial_profile.expect("profile");
        assert_eq!(profile.min_salary, Some(65_000));
        assert_eq!(profile.has, vec!["401k".to_string()]);
        assert_eq!(brief.filters.date_range.as_deref(), Some("past_30_days"));
    }

    #[test]
    fn test_explicit_window_and_state_code() {
        let brief = extract("Find software engineers in TX hired in the past 2 weeks");
        assert_eq!(brief.action.as_deref(), Some(ACTION_PROSPECT_CONTACTS));
        assert_eq!(brief.filters.location.as_deref(), Some("Texas"));
        assert_eq!(brief.filters.date_range.as_deref(), Some("past_14_days"));
        assert_eq!(
            brief.target_persona.description.as_deref(),
            Some("software engineers in Technology")
        );
    }

    #[test]
    fn test_longest_state_name_wins() {
        let brief = extract("nurses in west virginia hospitals");
        assert_eq!(brief.filters.location.as_deref(), Some("West Virginia"));
        assert_eq!(brief.filters.industry.as_deref(), Some("Healthcare"));
    }

    #[test]
    fn test_offering_and_category() {
        let brief = extract("find product managers in new york and offer an investment tool to them");
        let offering = brief.offering.expect("offering");
        assert_eq!(offering.product.as_deref(), Some("an investment tool"));
        assert_eq!(offering.category.as_deref(), Some("investment"));
    }

    #[test]
    fn test_unrecognised_prompt_has_no_action() {
        let brief = extract("hello there");
        assert!(brief.action.is_none());
        assert!(brief.target_persona.description.is_none());
        assert_eq!(brief.raw_prompt, "hello there");
    }
}
