//! Fields derived from posting text: salary, experience, skills.

use std::sync::LazyLock;

use regex::Regex;

use super::{ExperienceRange, SalaryRange};

static RE_SALARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([$€£])\s?(\d{1,3}(?:,\d{3}){1,3}|\d{1,12})(k)?(?:\s*(?:-|–|to)\s*[$€£]?\s?(\d{1,3}(?:,\d{3}){1,3}|\d{1,12})(k)?)?",
    )
    .unwrap()
});
static RE_EXPERIENCE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\s*(?:-|–|to)\s*(\d{1,2})\+?\s*(?:years?|yrs?)\b").unwrap()
});
static RE_EXPERIENCE_MIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})\+?\s*(?:years?|yrs?)\b").unwrap());

/// Smallest amount read as a salary rather than an incidental price.
const MIN_SALARY: i64 = 1_000;
/// Anything above this is noise, not pay.
const MAX_SALARY: i64 = 100_000_000;

const SKILLS: &[&str] = &[
    "aws",
    "azure",
    "c#",
    "c++",
    "css",
    "docker",
    "excel",
    "figma",
    "gcp",
    "git",
    "graphql",
    "html",
    "java",
    "javascript",
    "kotlin",
    "kubernetes",
    "linux",
    "machine learning",
    "mongodb",
    "mysql",
    "node.js",
    "php",
    "postgresql",
    "python",
    "react",
    "redis",
    "ruby",
    "rust",
    "salesforce",
    "seo",
    "sql",
    "swift",
    "tableau",
    "terraform",
    "typescript",
];

static SKILL_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    SKILLS
        .iter()
        .map(|skill| {
            let pattern = format!(r"(?i)(?:^|[^\w]){}(?:$|[^\w+#])", regex::escape(skill));
            (*skill, Regex::new(&pattern).unwrap())
        })
        .collect()
});

/// Finds the first salary figure or range in `text`.
///
/// Understands `$80,000 - $120,000`, `£45k to 55k` and single figures.
pub fn extract_salary(text: &str) -> Option<SalaryRange> {
    RE_SALARY.captures_iter(text).find_map(|caps| {
        let currency = match caps.get(1)?.as_str() {
            "$" => "USD",
            "€" => "EUR",
            "£" => "GBP",
            _ => return None,
        };
        let thousands_on_max = caps.get(5).is_some();
        let min = parse_amount(caps.get(2)?.as_str(), caps.get(3).is_some() || thousands_on_max)?;
        let max = match caps.get(4) {
            Some(m) => Some(parse_amount(m.as_str(), thousands_on_max || caps.get(3).is_some())?),
            None => None,
        };

        if !(MIN_SALARY..=MAX_SALARY).contains(&min) {
            return None;
        }

        Some(SalaryRange {
            min: Some(min),
            max: max.filter(|m| (min..=MAX_SALARY).contains(m)),
            currency: Some(currency.to_string()),
        })
    })
}

fn parse_amount(raw: &str, thousands: bool) -> Option<i64> {
    let value: i64 = raw.replace(',', "").parse().ok()?;
    if thousands {
        value.checked_mul(1000)
    } else {
        Some(value)
    }
}

/// Reads "3-5 years" or "5+ years" style requirements.
pub fn extract_experience(text: &str) -> Option<ExperienceRange> {
    if let Some(caps) = RE_EXPERIENCE_RANGE.captures(text) {
        let min: i64 = caps[1].parse().ok()?;
        let max: i64 = caps[2].parse().ok()?;
        if min <= max {
            return Some(ExperienceRange {
                min: Some(min),
                max: Some(max),
            });
        }
    }

    let caps = RE_EXPERIENCE_MIN.captures(text)?;
    Some(ExperienceRange {
        min: Some(caps[1].parse().ok()?),
        max: None,
    })
}

/// Returns the known skills mentioned in the title or description, sorted.
pub fn extract_skills(title: &str, description: &str) -> Vec<String> {
    let haystack = format!("{}\n{}", title, description);
    SKILL_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(&haystack))
        .map(|(skill, _)| skill.to_string())
        .collect()
}
