//! Core domain model for RSNW: the persisted news item and its status
//! machine, the ephemeral harvest records, bilingual date normalisation and
//! the relevance filter.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rsnw-core";

/// Description used when neither the article body nor the search snippet
/// yielded anything usable.
pub const NO_SUMMARY_PLACEHOLDER: &str = "無摘要";

/// Prefix marking a description that fell back to the search-result snippet.
pub const SNIPPET_PREFIX: &str = "[搜尋摘要] ";

/// Submission status of a stored item. `New` items are eligible for
/// submission; `Submitted` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    New,
    Submitted,
    Error,
}

impl ItemStatus {
    /// Single-character storage code.
    pub fn as_code(self) -> &'static str {
        match self {
            ItemStatus::New => "N",
            ItemStatus::Submitted => "Y",
            ItemStatus::Error => "E",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "N" => Some(ItemStatus::New),
            "Y" => Some(ItemStatus::Submitted),
            "E" => Some(ItemStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Submitted | ItemStatus::Error)
    }
}

/// Persisted news row. Identity is storage-assigned; (title, url) is the
/// natural dedupe key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub publish_date: NaiveDate,
    pub source: String,
    pub description: String,
    pub status: ItemStatus,
    pub fail_count: u32,
}

/// Raw scraped search-result entry, before cleaning/enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub title: String,
    pub url: String,
    /// Free-text date as it appeared on the results page ("3 days ago",
    /// "昨天", "Jul 19, 2025", ...).
    pub date_raw: String,
    /// Category label of the search task that produced this entry.
    pub source: String,
    pub snippet: Option<String>,
}

/// Cleaned candidate ready for the deduplicated insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedRecord {
    pub title: String,
    pub url: String,
    pub publish_date: NaiveDate,
    pub source: String,
    pub description: String,
}

/// One harvest's worth of cleaned records plus the shared capture moment.
/// Never persisted; `captured_at` only travels to the external form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedBatch {
    pub records: Vec<CleanedRecord>,
    pub captured_at: String,
}

impl CapturedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Normalise a loosely-formatted bilingual date string to a calendar date.
///
/// Total: any unparseable input falls back to `today`. Relative phrases are
/// resolved against `today`; months are a flat 30 days, no calendar-month
/// arithmetic.
pub fn normalize_date(raw: &str, today: NaiveDate) -> NaiveDate {
    let raw = raw.trim();
    let lower = raw.to_lowercase();

    // Relative phrases: "3 days ago", "5 mins ago", "2 週前", "3 天前".
    if lower.contains("ago") || raw.contains('前') {
        let n = leading_number(raw).unwrap_or(0);
        if lower.contains("min") || lower.contains("hour") || raw.contains("分鐘") || raw.contains("小時") {
            return today;
        }
        if lower.contains("day") || raw.contains('天') {
            return today - Duration::days(n);
        }
        if lower.contains("week") || raw.contains('週') || raw.contains('周') {
            return today - Duration::weeks(n);
        }
        if lower.contains("month") || raw.contains("個月") {
            return today - Duration::days(n * 30);
        }
    }

    if lower.contains("yesterday") || raw.contains("昨天") {
        return today - Duration::days(1);
    }

    for format in ["%b %d, %Y", "%B %d, %Y", "%d %b %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date;
        }
    }

    if raw.contains('年') && raw.contains('月') {
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y年%m月%d日") {
            return date;
        }
    }

    today
}

fn leading_number(text: &str) -> Option<i64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Keyword classifier deciding whether a scraped entry belongs in the
/// dataset. An entry is relevant when it matches the brand set AND at least
/// one of the two topical sets; the brand match is mandatory.
#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    brand_terms: Vec<String>,
    product_terms: Vec<String>,
    security_terms: Vec<String>,
}

impl Default for RelevanceFilter {
    fn default() -> Self {
        Self::new(
            ["asus", "華碩"],
            ["router", "rt-", "firmware", "aimesh", "路由器", "韌體"],
            [
                "security", "vulnerability", "cve", "exploit", "patch", "breach", "botnet",
                "backdoor", "資安", "漏洞", "攻擊", "修補",
            ],
        )
    }
}

impl RelevanceFilter {
    pub fn new<B, P, S>(brand: B, product: P, security: S) -> Self
    where
        B: IntoIterator,
        B::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        fn lowered<I>(terms: I) -> Vec<String>
        where
            I: IntoIterator,
            I::Item: AsRef<str>,
        {
            terms
                .into_iter()
                .map(|t| t.as_ref().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        }
        Self {
            brand_terms: lowered(brand),
            product_terms: lowered(product),
            security_terms: lowered(security),
        }
    }

    pub fn is_relevant(&self, title: &str, snippet: &str) -> bool {
        let haystack = format!("{} {}", title, snippet).to_lowercase();
        let matches_any = |terms: &[String]| terms.iter().any(|t| haystack.contains(t.as_str()));

        if !matches_any(&self.brand_terms) {
            return false;
        }
        matches_any(&self.product_terms) || matches_any(&self.security_terms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    #[test]
    fn relative_chinese_days() {
        assert_eq!(
            normalize_date("3 天前", run_date()),
            NaiveDate::from_ymd_opt(2024, 6, 7).unwrap()
        );
    }

    #[test]
    fn relative_english_units() {
        let today = run_date();
        assert_eq!(normalize_date("5 mins ago", today), today);
        assert_eq!(normalize_date("2 hours ago", today), today);
        assert_eq!(
            normalize_date("3 days ago", today),
            NaiveDate::from_ymd_opt(2024, 6, 7).unwrap()
        );
        assert_eq!(
            normalize_date("2 weeks ago", today),
            NaiveDate::from_ymd_opt(2024, 5, 27).unwrap()
        );
        // Flat 30-day months.
        assert_eq!(
            normalize_date("1 month ago", today),
            NaiveDate::from_ymd_opt(2024, 5, 11).unwrap()
        );
    }

    #[test]
    fn yesterday_both_languages() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 9).unwrap();
        assert_eq!(normalize_date("Yesterday", run_date()), expected);
        assert_eq!(normalize_date("昨天", run_date()), expected);
    }

    #[test]
    fn absolute_forms() {
        assert_eq!(
            normalize_date("Jul 19, 2025", run_date()),
            NaiveDate::from_ymd_opt(2025, 7, 19).unwrap()
        );
        assert_eq!(
            normalize_date("19 July 2025", run_date()),
            NaiveDate::from_ymd_opt(2025, 7, 19).unwrap()
        );
        assert_eq!(
            normalize_date("2025年7月19日", run_date()),
            NaiveDate::from_ymd_opt(2025, 7, 19).unwrap()
        );
    }

    #[test]
    fn unparseable_falls_back_to_today() {
        assert_eq!(normalize_date("???", run_date()), run_date());
        assert_eq!(normalize_date("", run_date()), run_date());
        assert_eq!(normalize_date("mañana", run_date()), run_date());
    }

    #[test]
    fn never_panics_on_arbitrary_input() {
        for raw in ["9999999 days ago", "年月日", "前", "ago", "\u{0}weird", "   "] {
            let _ = normalize_date(raw, run_date());
        }
    }

    #[test]
    fn brand_plus_topic_is_relevant() {
        let filter = RelevanceFilter::default();
        assert!(filter.is_relevant("ASUS Router RT-AX88U firmware patch fixes CVE", ""));
        assert!(filter.is_relevant("華碩路由器爆資安漏洞", ""));
    }

    #[test]
    fn brand_alone_is_not_relevant() {
        let filter = RelevanceFilter::default();
        assert!(!filter.is_relevant("ASUS laptop review", "great screen, decent battery"));
    }

    #[test]
    fn topic_without_brand_is_not_relevant() {
        let filter = RelevanceFilter::default();
        assert!(!filter.is_relevant("Router vulnerability disclosed", "CVE in popular firmware"));
    }

    #[test]
    fn snippet_can_supply_the_topic_match() {
        let filter = RelevanceFilter::default();
        assert!(filter.is_relevant("ASUS advisory", "patch your router firmware now"));
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [ItemStatus::New, ItemStatus::Submitted, ItemStatus::Error] {
            assert_eq!(ItemStatus::from_code(status.as_code()), Some(status));
        }
        assert_eq!(ItemStatus::from_code("X"), None);
        assert!(!ItemStatus::New.is_terminal());
        assert!(ItemStatus::Submitted.is_terminal());
        assert!(ItemStatus::Error.is_terminal());
    }
}
