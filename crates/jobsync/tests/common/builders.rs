//! Builders for feed payloads and items.

#![allow(dead_code)]

use jobsync::feed::{JobType, NormalizedItem};

/// One `<item>` of a Jobicy-style feed.
#[derive(Debug, Clone)]
pub struct JobicyItem {
    pub guid: String,
    pub title: String,
    pub company: String,
    pub description: String,
    pub location: Option<String>,
    pub job_type: Option<String>,
    pub category: Option<String>,
}

impl JobicyItem {
    pub fn new(guid: &str, title: &str) -> Self {
        Self {
            guid: guid.to_string(),
            title: title.to_string(),
            company: "Acme".to_string(),
            description: "Remote position. 3+ years of Rust and PostgreSQL.".to_string(),
            location: Some("Anywhere".to_string()),
            job_type: Some("Full-Time".to_string()),
            category: None,
        }
    }

    pub fn company(mut self, company: &str) -> Self {
        self.company = company.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    fn render(&self) -> String {
        let mut xml = format!(
            "<item><title>{}</title><link>https://jobicy.com/jobs/{}</link>\
             <guid isPermaLink=\"false\">{}</guid><description>{}</description>\
             <job_listing:company>{}</job_listing:company>",
            escape(&self.title),
            escape(&self.guid),
            escape(&self.guid),
            escape(&self.description),
            escape(&self.company),
        );
        if let Some(location) = &self.location {
            xml.push_str(&format!(
                "<job_listing:location>{}</job_listing:location>",
                escape(location)
            ));
        }
        if let Some(job_type) = &self.job_type {
            xml.push_str(&format!(
                "<job_listing:job_type>{}</job_listing:job_type>",
                escape(job_type)
            ));
        }
        if let Some(category) = &self.category {
            xml.push_str(&format!(
                "<job_listing:job_category>{}</job_listing:job_category>",
                escape(category)
            ));
        }
        xml.push_str("</item>");
        xml
    }
}

/// Builds a Jobicy RSS document.
pub fn jobicy_feed(items: &[JobicyItem]) -> String {
    let body: String = items.iter().map(JobicyItem::render).collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <rss version=\"2.0\" xmlns:job_listing=\"https://jobicy.com\">\
         <channel><title>Jobicy</title>{}</channel></rss>",
        body
    )
}

/// Builds a HigherEdJobs RSS document from `(guid, title)` pairs.
pub fn higher_ed_feed(items: &[(&str, &str)]) -> String {
    let body: String = items
        .iter()
        .map(|(guid, title)| {
            format!(
                "<item><title>{}</title><link>https://www.higheredjobs.com/details.cfm?JobCode={}</link>\
                 <guid>{}</guid><description>Faculty opening.</description></item>",
                escape(title),
                escape(guid),
                escape(guid)
            )
        })
        .collect();
    format!("<rss version=\"2.0\"><channel>{}</channel></rss>", body)
}

/// A canonical item for enqueueing directly.
pub fn normalized_item(external_id: &str) -> NormalizedItem {
    NormalizedItem {
        title: format!("Engineer {}", external_id),
        company: "Acme".to_string(),
        description: "Build things.".to_string(),
        location: Some("Remote".to_string()),
        job_type: JobType::FullTime,
        category: None,
        url: format!("https://example.com/jobs/{}", external_id),
        source: "jobicy".to_string(),
        external_id: external_id.to_string(),
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
