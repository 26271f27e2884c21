use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::browser::adapter::{clean_text, first_match, first_text, path_slug, PageKind};
use crate::crawler::task::WorkItem;
use crate::storage::records::Keyed;

/// Company profile extracted from an "about" page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    pub company_id: String,
    pub name: String,
    pub universal_name: String,
    pub tagline: String,
    pub description: String,
    pub website: String,
    pub phone: String,
    pub industry: String,
    pub company_size: String,
    pub employee_count: Option<u32>,
    pub company_type: String,
    pub founded: String,
    pub headquarters: String,
    pub follower_count: Option<u64>,
    pub specialties: Vec<String>,
    pub profile_url: String,
    pub scraped_at: DateTime<Utc>,
}

impl Keyed for CompanyRecord {
    fn key(&self) -> &str {
        &self.company_id
    }
}

/// Company "about" pages
pub struct CompanyPage;

impl PageKind for CompanyPage {
    type Record = CompanyRecord;

    fn page_url(item: &WorkItem) -> String {
        format!("{}/about/", item.as_str().trim_end_matches('/'))
    }

    fn parse(html: &str, item: &WorkItem) -> Option<CompanyRecord> {
        parse_company(html, item.as_str())
    }
}

/// Company slug from a profile URL such as `https://host/company/acme/`
pub fn company_slug(url: &str) -> Option<String> {
    path_slug(url, "company")
}

/// Rough head count from a size band such as `51-200` or `10,001+`
pub fn estimate_employees(size: &str) -> Option<u32> {
    let digits = size.replace(',', "");
    let numbers: Vec<u32> = Regex::new(r"\d+")
        .ok()?
        .find_iter(&digits)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();

    match numbers.as_slice() {
        [min, max, ..] => Some((min + max) / 2),
        [min] if digits.contains('+') => Some(min.saturating_add(min / 2)),
        [exact] => Some(*exact),
        [] => None,
    }
}

/// Label/value pairs from the `<dt>`/`<dd>` details list
fn detail_pairs(document: &Html) -> Vec<(String, ElementRef<'_>)> {
    let Ok(selector) = Selector::parse("dt") else {
        return Vec::new();
    };

    document
        .select(&selector)
        .filter_map(|dt| {
            let label = clean_text(dt).to_lowercase();
            let dd = dt
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .next()
                .filter(|el| el.value().name() == "dd")?;
            Some((label, dd))
        })
        .collect()
}

/// Parse a company about page. `None` when the page has no company name.
pub fn parse_company(html: &str, profile_url: &str) -> Option<CompanyRecord> {
    let document = Html::parse_document(html);

    let name = first_text(&document, &["h1.org-top-card-summary__title", "h1"]);
    if name.is_empty() {
        return None;
    }

    let universal_name = company_slug(profile_url).unwrap_or_else(|| name.to_lowercase().replace(' ', "-"));

    let mut record = CompanyRecord {
        company_id: universal_name.clone(),
        name,
        universal_name,
        tagline: first_text(&document, &[".org-top-card-summary__tagline", "[class*=\"tagline\"]"]),
        description: first_text(
            &document,
            &[
                ".org-about-us-organization-description__text",
                ".lt-line-clamp__raw-line",
                "section p",
            ],
        ),
        website: String::new(),
        phone: String::new(),
        industry: String::new(),
        company_size: String::new(),
        employee_count: None,
        company_type: String::new(),
        founded: String::new(),
        headquarters: String::new(),
        follower_count: None,
        specialties: Vec::new(),
        profile_url: profile_url.to_string(),
        scraped_at: Utc::now(),
    };

    let link = Selector::parse("a[href]").ok();
    for (label, dd) in detail_pairs(&document) {
        let value = clean_text(dd);
        if label.contains("website") {
            record.website = link
                .as_ref()
                .and_then(|s| dd.select(s).next())
                .and_then(|a| a.value().attr("href"))
                .map(str::to_string)
                .unwrap_or(value);
        } else if label.contains("phone") {
            record.phone = first_match(r"[+\d][\d\s()\-]{5,}\d", &value).unwrap_or(value);
        } else if label.contains("industr") {
            record.industry = value;
        } else if label.contains("company size") {
            record.company_size = first_match(r"([\d,]+\s*[-–]\s*[\d,]+|[\d,]+\+)", &value).unwrap_or_default();
        } else if label.contains("headquarters") {
            record.headquarters = value;
        } else if label.contains("type") {
            record.company_type = value;
        } else if label.contains("founded") {
            record.founded = first_match(r"\d{4}", &value).unwrap_or_default();
        } else if label.contains("specialties") {
            record.specialties = value
                .split(',')
                .map(|s| s.trim().trim_start_matches("and ").to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    record.employee_count = estimate_employees(&record.company_size);

    let followers = first_text(
        &document,
        &[".org-top-card-summary-info-list__info-item", "[class*=\"follower\"]"],
    );
    record.follower_count = first_match(r"(?i)([\d,]+)\s+followers?", &followers)
        .and_then(|n| n.replace(',', "").parse().ok());

    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABOUT_PAGE: &str = r#"
        <html><body>
          <h1 class="org-top-card-summary__title"> Acme  Corp </h1>
          <p class="org-top-card-summary__tagline">Everything for roadrunners</p>
          <div class="org-top-card-summary-info-list__info-item">12,345 followers</div>
          <section>
            <p class="org-about-us-organization-description__text">
              Acme builds   anvils.
            </p>
            <dl>
              <dt><h3>Website</h3></dt>
              <dd><a href="https://acme.example">acme.example</a></dd>
              <dt><h3>Phone</h3></dt>
              <dd>+1 (555) 123-4567 Phone number is verified</dd>
              <dt><h3>Industry</h3></dt>
              <dd>Manufacturing</dd>
              <dt><h3>Company size</h3></dt>
              <dd>51-200 employees</dd>
              <dd>180 associated members</dd>
              <dt><h3>Headquarters</h3></dt>
              <dd>Phoenix, Arizona</dd>
              <dt><h3>Founded</h3></dt>
              <dd>Founded in 1949</dd>
              <dt><h3>Specialties</h3></dt>
              <dd>anvils, rockets, and traps</dd>
            </dl>
          </section>
        </body></html>
    "#;

    #[test]
    fn test_parse_company() {
        let record = parse_company(ABOUT_PAGE, "https://www.example.com/company/acme-corp/").unwrap();

        assert_eq!(record.company_id, "acme-corp");
        assert_eq!(record.name, "Acme Corp");
        assert_eq!(record.tagline, "Everything for roadrunners");
        assert_eq!(record.description, "Acme builds anvils.");
        assert_eq!(record.website, "https://acme.example");
        assert_eq!(record.phone, "+1 (555) 123-4567");
        assert_eq!(record.industry, "Manufacturing");
        assert_eq!(record.company_size, "51-200");
        assert_eq!(record.employee_count, Some(125));
        assert_eq!(record.headquarters, "Phoenix, Arizona");
        assert_eq!(record.founded, "1949");
        assert_eq!(record.follower_count, Some(12_345));
        assert_eq!(record.specialties, vec!["anvils", "rockets", "traps"]);
    }

    #[test]
    fn test_page_without_name_is_empty() {
        assert_eq!(parse_company("<html><body><p>Sign in</p></body></html>", "https://x/company/a/"), None);
    }

    #[test]
    fn test_estimate_employees() {
        assert_eq!(estimate_employees("51-200"), Some(125));
        assert_eq!(estimate_employees("1,001-5,000"), Some(3000));
        assert_eq!(estimate_employees("10,001+"), Some(15_001));
        assert_eq!(estimate_employees("1"), Some(1));
        assert_eq!(estimate_employees(""), None);
    }

    #[test]
    fn test_company_slug() {
        assert_eq!(company_slug("https://www.example.com/company/acme/").as_deref(), Some("acme"));
        assert_eq!(company_slug("https://www.example.com/company/acme?trk=x").as_deref(), Some("acme"));
        assert_eq!(company_slug("https://www.example.com/in/someone/"), None);
    }

    #[test]
    fn test_about_url() {
        let item = WorkItem::from("https://www.example.com/company/acme/");
        assert_eq!(CompanyPage::page_url(&item), "https://www.example.com/company/acme/about/");
    }
}
