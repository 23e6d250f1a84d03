use serde::{Deserialize, Serialize};

use crate::domain::{Person, PersonId, Relation};

/// Where the view router should go next after a lifecycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Create,
    Search,
    View(PersonId),
}

impl Outcome {
    pub fn token(&self) -> String {
        match self {
            Outcome::Create => "create?faces-redirect=true".to_string(),
            Outcome::Search => "search?faces-redirect=true".to_string(),
            Outcome::View(id) => format!("view?faces-redirect=true&id={id}"),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.token())
    }
}

impl Serialize for Outcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.token())
    }
}

/// Whether a retrieve call comes from the first render of a form or from a
/// resubmission of that same form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    #[default]
    Initial,
    Postback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Error,
}

/// A message shown to the user on the current screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub severity: Severity,
    pub text: String,
}

impl UserMessage {
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<UserMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person: Option<Person>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub example: Person,
    #[serde(default)]
    pub page: u32,
    /// Start over from the first page, as a fresh search does.
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageView {
    pub items: Vec<Person>,
    pub count: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationSummary {
    pub id: i64,
    pub name: String,
    pub member_count: usize,
}

impl From<&Relation> for RelationSummary {
    fn from(value: &Relation) -> Self {
        Self {
            id: value.id.0,
            name: value.name.clone(),
            member_count: value.members.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_tokens_keep_router_literals() {
        assert_eq!(Outcome::Create.token(), "create?faces-redirect=true");
        assert_eq!(Outcome::Search.token(), "search?faces-redirect=true");
        assert_eq!(
            Outcome::View(PersonId(42)).token(),
            "view?faces-redirect=true&id=42"
        );
    }

    #[test]
    fn navigation_response_serializes_outcome_as_token() {
        let response = NavigationResponse {
            outcome: Some(Outcome::View(PersonId(7))),
            conversation_id: None,
            messages: Vec::new(),
        };
        let json = serde_json::to_value(&response).expect("json");
        assert_eq!(
            json,
            serde_json::json!({ "outcome": "view?faces-redirect=true&id=7" })
        );
    }

    #[test]
    fn search_request_defaults_to_match_all_first_page() {
        let request: SearchRequest = serde_json::from_str("{}").expect("json");
        assert_eq!(request.page, 0);
        assert!(!request.reset);
        assert!(request.example.firstname.is_empty());
        assert!(request.example.relation.is_none());
    }
}
