//! Prompt construction and parsing of the sectioned reply.

use serde_json::Value;

use course_lens::messages::{ExplanationRequest, ProductDetails, Sections};

/// Emoji that open a section in the model's reply.
pub const SECTION_MARKERS: [&str; 7] = ["📋", "🎯", "💡", "🔍", "📚", "📈", "💫"];

const REPLY_FORMAT: &str = "\
📋 Summary: <one or two sentences on what the course covers>
🎯 Relevance: <why this course fits the search query>
💡 Key Skills: <the main skills a learner gains>
🔍 Topics: <the topics that connect the course to the query>
📚 Content Format: <how the material is delivered>
📈 Level: <who the course is aimed at>
💫 Recommendation: <who should take it and why>";

/// Build the completion prompt for one product.
pub fn build_prompt(
    explanation: &ExplanationRequest,
    details: &ProductDetails,
    search_query: &str,
) -> String {
    let mut prompt = String::new();
    match explanation {
        ExplanationRequest::FallbackMode => {
            prompt.push_str(
                "You are an expert at recommending online courses. The relevance signals \
                 that normally explain this search result are unavailable, so explain the \
                 match from the course metadata alone.\n\n",
            );
        }
        ExplanationRequest::Raw(_) => {
            prompt.push_str(
                "You are an expert at recommending online courses. Below is the raw ranking \
                 explanation a search engine produced for one result. Translate it into a \
                 short, readable explanation of why the course matched.\n\n",
            );
        }
    }
    prompt.push_str(
        "IMPORTANT: describe the course in the third person and never address the reader \
         as \"you\".\n\n",
    );
    prompt.push_str(&format!("SEARCH QUERY: \"{search_query}\"\n\n"));
    prompt.push_str(&course_details(details));

    match explanation {
        ExplanationRequest::FallbackMode => {
            prompt.push_str("\nFULL COURSE DATA:\n");
            prompt.push_str(&pretty(&full_data(details)));
            prompt.push('\n');
        }
        ExplanationRequest::Raw(raw) => {
            prompt.push_str(
                "\nCRITICAL: do not quote scores, weights or any other numbers from the \
                 ranking data. Describe what they mean instead.\n",
            );
            prompt.push_str("\nRAW SEARCH EXPLANATION:\n");
            prompt.push_str(&pretty(raw));
            prompt.push_str("\n\nADDITIONAL COURSE DATA:\n");
            prompt.push_str(&pretty(&full_data(details)));
            prompt.push('\n');
        }
    }

    prompt.push_str("\nAnswer in EXACTLY this format, one section per line:\n\n");
    prompt.push_str(REPLY_FORMAT);
    prompt.push_str("\n\nNote: keep every section to one or two sentences.");
    prompt
}

fn course_details(details: &ProductDetails) -> String {
    let skills = if details.skills.is_empty() {
        "Not specified".to_string()
    } else {
        details.skills.join(", ")
    };
    let pricing = if details.is_course_free { "Free" } else { "Paid" };
    format!(
        "COURSE DETAILS:\n\
         - Title: {}\n\
         - Partner: {}\n\
         - Description: {}\n\
         - Skills: {}\n\
         - Rating: {} ({} ratings)\n\
         - URL: {}\n\
         - Entity Type: {}\n\
         - Pricing: {}\n",
        details.title,
        details.partner,
        details.description,
        skills,
        details.average_rating,
        details.num_ratings,
        details.url,
        details.entity_type,
        pricing,
    )
}

fn full_data(details: &ProductDetails) -> Value {
    if details.raw_response_data.is_null() {
        serde_json::to_value(details).unwrap_or(Value::Null)
    } else {
        details.raw_response_data.clone()
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Split a reply into labelled sections.
///
/// A line opening with a section marker starts a section; the label runs up
/// to the first `": "`. Following lines continue the open section. Text
/// before the first marker is dropped, as are sections that end up empty.
pub fn parse_sections(reply: &str) -> Sections {
    let mut sections = Sections::default();
    let mut current: Option<(String, String)> = None;

    for line in reply.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if SECTION_MARKERS.iter().any(|marker| line.starts_with(marker)) {
            if let Some((label, content)) = current.take() {
                push_section(&mut sections, label, content);
            }
            let mut parts = line.split(": ");
            let label = parts.next().unwrap_or_default().trim().to_string();
            let content = parts.collect::<Vec<_>>().join(": ");
            current = Some((label, content));
        } else if let Some((_, content)) = current.as_mut() {
            content.push(' ');
            content.push_str(line);
        }
    }
    if let Some((label, content)) = current {
        push_section(&mut sections, label, content);
    }
    sections
}

/// A repeated label replaces the earlier text in place.
fn push_section(sections: &mut Sections, label: String, content: String) {
    let content = content.trim().to_string();
    if content.is_empty() {
        return;
    }
    match sections.0.iter_mut().find(|(l, _)| *l == label) {
        Some(existing) => existing.1 = content,
        None => sections.0.push((label, content)),
    }
}
