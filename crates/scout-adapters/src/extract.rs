//! Raw page content -> `NormalizedProfile`. Pure and deterministic.

use scout_core::{ContentType, NormalizedProfile, ProfileSection, RawProfile};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

const SECTION_HEADINGS: &[&str] = &[
    "About",
    "Experience",
    "Education",
    "Skills",
    "Licenses & certifications",
    "Languages",
];

const OVERVIEW_SECTION: &str = "Overview";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("page content is empty")]
    EmptyContent,
    #[error("no candidate name found on page")]
    MissingName,
    #[error("invalid selector `{0}`")]
    Selector(String),
}

pub fn extract_profile(raw: &RawProfile) -> Result<NormalizedProfile, ExtractError> {
    if raw.body.trim().is_empty() {
        return Err(ExtractError::EmptyContent);
    }
    match raw.content_type {
        ContentType::Html => extract_html(&raw.profile_id, &raw.body),
        ContentType::Text => extract_text(&raw.profile_id, &raw.body),
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = collapse_whitespace(&value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|_| ExtractError::Selector(css.to_string()))
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<Vec<_>>().join(" "))
}

fn select_first_text(document: &Html, candidates: &[&str]) -> Result<Option<String>, ExtractError> {
    for css in candidates {
        let sel = selector(css)?;
        if let Some(text) = document.select(&sel).find_map(element_text) {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn extract_html(profile_id: &str, body: &str) -> Result<NormalizedProfile, ExtractError> {
    let document = Html::parse_document(body);
    let name = select_first_text(&document, &["h1"])?.ok_or(ExtractError::MissingName)?;
    let headline = select_first_text(&document, &[".text-body-medium", ".headline"])?;
    let location = select_first_text(&document, &[".location", ".text-body-small.inline"])?;

    let section_sel = selector("section")?;
    let heading_sel = selector("h2")?;
    let mut sections = Vec::new();
    for section in document.select(&section_sel) {
        let Some(title) = section.select(&heading_sel).find_map(element_text) else {
            continue;
        };
        let Some(full) = element_text(section) else {
            continue;
        };
        let body = full
            .strip_prefix(title.as_str())
            .map(str::trim)
            .unwrap_or(full.as_str())
            .to_string();
        if !body.is_empty() {
            sections.push(ProfileSection { title, body });
        }
    }

    Ok(NormalizedProfile {
        profile_id: profile_id.to_string(),
        name,
        headline,
        location,
        sections,
    })
}

fn heading_for(line: &str) -> Option<&'static str> {
    SECTION_HEADINGS
        .iter()
        .copied()
        .find(|heading| heading.eq_ignore_ascii_case(line))
}

fn extract_text(profile_id: &str, body: &str) -> Result<NormalizedProfile, ExtractError> {
    let lines = body
        .lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    let mut rest = lines.iter().map(String::as_str).peekable();

    let name = match rest.next() {
        Some(line) if heading_for(line).is_none() => line.to_string(),
        _ => return Err(ExtractError::MissingName),
    };
    let headline = rest
        .next_if(|line| heading_for(line).is_none())
        .map(ToString::to_string);
    let location = if headline.is_some() {
        rest.next_if(|line| heading_for(line).is_none())
            .map(ToString::to_string)
    } else {
        None
    };

    let mut sections: Vec<ProfileSection> = Vec::new();
    for line in rest {
        if let Some(heading) = heading_for(line) {
            sections.push(ProfileSection {
                title: heading.to_string(),
                body: String::new(),
            });
            continue;
        }
        match sections.last_mut() {
            Some(section) => {
                if !section.body.is_empty() {
                    section.body.push('\n');
                }
                section.body.push_str(line);
            }
            None => sections.push(ProfileSection {
                title: OVERVIEW_SECTION.to_string(),
                body: line.to_string(),
            }),
        }
    }
    sections.retain(|s| !s.body.is_empty());

    Ok(NormalizedProfile {
        profile_id: profile_id.to_string(),
        name,
        headline,
        location,
        sections,
    })
}
