use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::browser::adapter::{clean_text, first_text, path_slug, PageKind};
use crate::crawler::task::WorkItem;
use crate::storage::records::Keyed;

/// Skills kept per profile
const MAX_SKILLS: usize = 10;

/// Seniority bands, most senior first. Keywords are whole words.
const SENIORITY_LEVELS: &[(&str, &[&str])] = &[
    ("C-Level", &["ceo", "cto", "cfo", "coo", "cmo", "chief", "president"]),
    ("VP", &["vp", "vice president"]),
    ("Director", &["director", "head of"]),
    ("Manager", &["manager", "lead"]),
    ("Senior", &["senior", "sr"]),
];

const DEPARTMENTS: &[(&str, &[&str])] = &[
    ("Sales", &["sales", "business development"]),
    ("Marketing", &["marketing"]),
    ("Engineering", &["engineer", "engineering", "developer"]),
    ("Executive", &["ceo", "founder"]),
];

/// Person profile extracted from a profile page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub profile_id: String,
    pub full_name: String,
    pub first_name: String,
    pub last_name: String,
    pub headline: String,
    pub current_title: String,
    pub current_company: String,
    pub location: String,
    pub photo_url: String,
    pub skills: Vec<String>,
    pub department: String,
    pub seniority_level: String,
    pub profile_url: String,
    pub scraped_at: DateTime<Utc>,
}

impl Keyed for ProfileRecord {
    fn key(&self) -> &str {
        &self.profile_id
    }
}

/// Person profile pages
pub struct ProfilePage;

impl PageKind for ProfilePage {
    type Record = ProfileRecord;

    fn page_url(item: &WorkItem) -> String {
        format!("{}/", item.as_str().trim_end_matches('/'))
    }

    fn parse(html: &str, item: &WorkItem) -> Option<ProfileRecord> {
        parse_profile(html, item.as_str())
    }
}

/// Public identifier from a profile URL such as `https://host/in/jane-doe/`
pub fn profile_slug(url: &str) -> Option<String> {
    path_slug(url, "in")
}

/// Lower-cased words padded with spaces, so `" lead "` matches whole words only
fn word_text(text: &str) -> String {
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    format!(" {} ", words.join(" "))
}

fn classify(words: &str, table: &[(&'static str, &[&str])]) -> Option<&'static str> {
    table
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| words.contains(&format!(" {} ", k))))
        .map(|(label, _)| *label)
}

/// Seniority band implied by a headline, `Mid-Level` when nothing matches
pub fn seniority_level(headline: &str) -> &'static str {
    // "vice president" must not count as president
    let words = word_text(headline).replace(" vice president ", " vp ");
    classify(&words, SENIORITY_LEVELS).unwrap_or("Mid-Level")
}

pub fn department(headline: &str) -> &'static str {
    classify(&word_text(headline), DEPARTMENTS).unwrap_or("Other")
}

/// `("Sales Director", "Acme")` from `"Sales Director at Acme"`
fn split_headline(headline: &str) -> (String, String) {
    match headline.split_once(" at ") {
        Some((title, company)) => (title.trim().to_string(), company.trim().to_string()),
        None => (headline.to_string(), String::new()),
    }
}

fn skills(document: &Html) -> Vec<String> {
    let Ok(selector) = Selector::parse("[data-field=\"skill_card_skill_topic\"] span") else {
        return Vec::new();
    };

    let mut skills: Vec<String> = Vec::new();
    for text in document.select(&selector).map(clean_text) {
        if text.is_empty() || text.len() >= 50 || skills.contains(&text) {
            continue;
        }
        skills.push(text);
        if skills.len() == MAX_SKILLS {
            break;
        }
    }
    skills
}

/// Parse a profile page. `None` when the page has no name.
pub fn parse_profile(html: &str, profile_url: &str) -> Option<ProfileRecord> {
    let document = Html::parse_document(html);

    let full_name = first_text(&document, &["h1"]);
    if full_name.is_empty() {
        return None;
    }

    let (first_name, last_name) = match full_name.split_once(' ') {
        Some((first, last)) => (first.to_string(), last.to_string()),
        None => (full_name.clone(), String::new()),
    };

    let headline = first_text(&document, &[".text-body-medium", "[class*=\"headline\"]"]);
    let (current_title, current_company) = split_headline(&headline);

    let photo_url = Selector::parse("img[alt*=\"Photo\"]")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .find_map(|img| img.value().attr("src").map(str::to_string))
        })
        .unwrap_or_default();

    Some(ProfileRecord {
        profile_id: profile_slug(profile_url).unwrap_or_else(|| full_name.to_lowercase().replace(' ', "-")),
        first_name,
        last_name,
        current_title,
        current_company,
        location: first_text(&document, &[".text-body-small.inline", "[class*=\"location\"]", ".text-body-small"]),
        photo_url,
        skills: skills(&document),
        department: department(&headline).to_string(),
        seniority_level: seniority_level(&headline).to_string(),
        headline,
        full_name,
        profile_url: profile_url.to_string(),
        scraped_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_PAGE: &str = r#"
        <html><body>
          <main>
            <img alt="Photo of Jane Doe" src="https://media.example/jane.jpg">
            <h1>Jane  van Doe</h1>
            <div class="text-body-medium">Sales Director at Acme Corp</div>
            <span class="text-body-small inline">Bangkok, Thailand</span>
            <section>
              <div data-field="skill_card_skill_topic"><span>Negotiation</span><span>Negotiation</span></div>
              <div data-field="skill_card_skill_topic"><span>CRM</span></div>
              <div data-field="skill_card_skill_topic"><span> </span></div>
            </section>
          </main>
        </body></html>
    "#;

    #[test]
    fn test_parse_profile() {
        let record = parse_profile(PROFILE_PAGE, "https://www.example.com/in/jane-doe/").unwrap();

        assert_eq!(record.profile_id, "jane-doe");
        assert_eq!(record.full_name, "Jane van Doe");
        assert_eq!(record.first_name, "Jane");
        assert_eq!(record.last_name, "van Doe");
        assert_eq!(record.headline, "Sales Director at Acme Corp");
        assert_eq!(record.current_title, "Sales Director");
        assert_eq!(record.current_company, "Acme Corp");
        assert_eq!(record.location, "Bangkok, Thailand");
        assert_eq!(record.photo_url, "https://media.example/jane.jpg");
        assert_eq!(record.skills, vec!["Negotiation", "CRM"]);
        assert_eq!(record.department, "Sales");
        assert_eq!(record.seniority_level, "Director");
    }

    #[test]
    fn test_profile_without_name_is_empty() {
        assert_eq!(parse_profile("<html><body><p>Join now</p></body></html>", "https://x/in/a/"), None);
    }

    #[test]
    fn test_seniority_level() {
        assert_eq!(seniority_level("CTO & Co-Founder"), "C-Level");
        assert_eq!(seniority_level("Vice President, Sales"), "VP");
        assert_eq!(seniority_level("Art Director"), "Director");
        assert_eq!(seniority_level("Head of Growth"), "Director");
        assert_eq!(seniority_level("Team Lead, Platform"), "Manager");
        assert_eq!(seniority_level("Sr. Software Engineer"), "Senior");
        assert_eq!(seniority_level("Leadership coach"), "Mid-Level");
    }

    #[test]
    fn test_department() {
        assert_eq!(department("Business Development Manager"), "Sales");
        assert_eq!(department("Growth Marketing Lead"), "Marketing");
        assert_eq!(department("Backend Developer"), "Engineering");
        assert_eq!(department("Co-Founder"), "Executive");
        assert_eq!(department("Accountant"), "Other");
    }

    #[test]
    fn test_profile_url() {
        let item = WorkItem::from("https://www.example.com/in/jane-doe");
        assert_eq!(ProfilePage::page_url(&item), "https://www.example.com/in/jane-doe/");
        assert_eq!(profile_slug("https://www.example.com/company/acme/"), None);
    }
}
