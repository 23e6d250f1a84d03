//! Maps people to and from the string keys used by selection controls.

use shared::{
    domain::{Person, PersonId},
    error::ApiError,
};
use storage::PersonStore;

use crate::{internal, session::PersistenceSession};

/// Looks a person up by the textual form of their id. An empty key means
/// "nothing selected" and resolves to `None`.
pub async fn resolve_by_key<S: PersonStore>(
    session: &mut PersistenceSession<S>,
    key: &str,
) -> Result<Option<Person>, ApiError> {
    let key = key.trim();
    if key.is_empty() {
        return Ok(None);
    }

    let id = key
        .parse::<i64>()
        .map_err(|_| ApiError::validation(format!("'{key}' is not a person key")))?;
    session.find(PersonId(id)).await.map_err(internal)
}

pub fn format_as_key(person: Option<&Person>) -> String {
    person
        .and_then(|person| person.uid)
        .map(|uid| uid.to_string())
        .unwrap_or_default()
}
