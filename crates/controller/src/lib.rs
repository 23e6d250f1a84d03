use shared::{
    domain::{Address, Person, PersonId, Relation},
    error::{ApiError, ErrorCode},
    protocol::{Outcome, PageView, Submission, UserMessage},
};
use storage::{
    filter::{PersonField, Predicate},
    is_constraint_violation, PersonStore,
};
use tracing::{debug, info, warn};

pub mod convert;
pub mod session;

pub use convert::{format_as_key, resolve_by_key};
pub use session::PersistenceSession;

pub const PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditScope {
    Inactive,
    Active,
}

/// Create/read/update/delete and paged search for people, scoped to one
/// user conversation.
///
/// An edit scope opens on [`begin_create`](Self::begin_create) or on the
/// first [`retrieve`](Self::retrieve) and ends on [`save`](Self::save) or
/// [`delete`](Self::delete), which also close the session.
pub struct PersonController<S: PersonStore> {
    session: PersistenceSession<S>,
    scope: EditScope,
    id: Option<PersonId>,
    person: Option<Person>,
    example: Person,
    page: u32,
    count: i64,
    page_items: Vec<Person>,
    add: Person,
    messages: Vec<UserMessage>,
}

impl<S: PersonStore> PersonController<S> {
    pub fn new(store: S) -> Self {
        Self {
            session: PersistenceSession::open(store),
            scope: EditScope::Inactive,
            id: None,
            person: None,
            example: Person::default(),
            page: 0,
            count: 0,
            page_items: Vec::new(),
            add: Person::default(),
            messages: Vec::new(),
        }
    }

    pub fn scope(&self) -> EditScope {
        self.scope
    }

    pub fn session(&mut self) -> &mut PersistenceSession<S> {
        &mut self.session
    }

    pub fn id(&self) -> Option<PersonId> {
        self.id
    }

    pub fn set_id(&mut self, id: Option<PersonId>) {
        self.id = id;
    }

    pub fn person(&self) -> Option<&Person> {
        self.person.as_ref()
    }

    /// Binds submitted form values onto the person being edited. Identity
    /// fields (`uid`, address id, creation time) are kept from the loaded
    /// entity; with nothing loaded the form becomes a new person.
    ///
    /// A form without an address leaves the stored address attached. The
    /// edit form never detaches an address; only [`delete`](Self::delete)
    /// unlinks one.
    pub fn apply_form(&mut self, form: Person) {
        match self.person.as_mut() {
            Some(person) => {
                person.firstname = form.firstname;
                person.lastname = form.lastname;
                person.relation = form.relation;
                person.address = match (person.address.take(), form.address) {
                    (Some(mut held), Some(submitted)) => {
                        held.street = submitted.street;
                        held.city = submitted.city;
                        held.zip = submitted.zip;
                        Some(held)
                    }
                    (held, None) => held,
                    (None, Some(submitted)) => Some(Address {
                        id: None,
                        person: person.uid,
                        ..submitted
                    }),
                };
            }
            None => {
                self.person = Some(Person {
                    uid: None,
                    created_at: None,
                    ..form
                });
            }
        }
    }

    pub fn example(&self) -> &Person {
        &self.example
    }

    pub fn set_example(&mut self, example: Person) {
        self.example = example;
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn set_page(&mut self, page: u32) {
        self.page = page;
    }

    pub fn page_size(&self) -> u32 {
        PAGE_SIZE
    }

    pub fn page_items(&self) -> &[Person] {
        &self.page_items
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn page_view(&self) -> PageView {
        PageView {
            items: self.page_items.clone(),
            count: self.count,
            page: self.page,
            page_size: PAGE_SIZE,
        }
    }

    pub fn messages(&self) -> &[UserMessage] {
        &self.messages
    }

    pub fn take_messages(&mut self) -> Vec<UserMessage> {
        std::mem::take(&mut self.messages)
    }

    /// Opens an edit scope for a new person. Calling it while a scope is
    /// already active keeps that scope.
    pub fn begin_create(&mut self) -> Outcome {
        if self.scope == EditScope::Active {
            debug!("edit scope already active; reusing it for create");
        } else {
            self.begin_scope();
        }
        Outcome::Create
    }

    /// Loads the person to edit. A postback keeps whatever is being edited.
    /// With no id the current search example becomes the edit target; an id
    /// that does not resolve leaves no person loaded.
    pub async fn retrieve(&mut self, submission: Submission) -> Result<(), ApiError> {
        if submission == Submission::Postback {
            return Ok(());
        }

        if self.scope == EditScope::Inactive {
            self.begin_scope();
        }

        self.person = match self.id {
            None => Some(self.example.clone()),
            Some(id) => self.find_by_id(id).await?,
        };
        Ok(())
    }

    pub async fn find_by_id(&mut self, id: PersonId) -> Result<Option<Person>, ApiError> {
        self.session.find(id).await.map_err(internal)
    }

    /// Inserts or updates the edited person. Failures are reported through
    /// [`messages`](Self::messages) and yield no navigation.
    pub async fn save(&mut self) -> Option<Outcome> {
        self.end_scope();
        let result = self.try_save().await;
        self.session.close();
        match result {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                self.report(err);
                None
            }
        }
    }

    async fn try_save(&mut self) -> Result<Outcome, ApiError> {
        let Some(person) = self.person.clone() else {
            return Err(ApiError::validation("no person is loaded for editing"));
        };

        if !self.session.contains(&person) {
            self.session.persist(person).map_err(write_failure)?;
            self.session.flush().await.map_err(write_failure)?;
            info!("person created");
            return Ok(Outcome::Search);
        }

        let uid = person
            .uid
            .ok_or_else(|| ApiError::internal("managed person has no id"))?;
        self.session.merge(person).map_err(write_failure)?;
        self.session.flush().await.map_err(write_failure)?;
        info!(person_id = %uid, "person updated");
        Ok(Outcome::View(uid))
    }

    /// Unlinks the selected person from its address and relation, then
    /// removes it. Failures are reported like [`save`](Self::save).
    pub async fn delete(&mut self) -> Option<Outcome> {
        self.end_scope();
        let result = self.try_delete().await;
        self.session.close();
        match result {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                self.report(err);
                None
            }
        }
    }

    async fn try_delete(&mut self) -> Result<Outcome, ApiError> {
        let id = self
            .id
            .ok_or_else(|| ApiError::validation("no person is selected for deletion"))?;
        let mut deletable = self
            .session
            .find(id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::not_found(format!("person {id} not found")))?;

        if let Some(mut address) = deletable.address.take() {
            address.person = None;
            self.session.merge_address(address);
        }

        if let Some(relation_id) = deletable.relation.take() {
            let relation = self
                .session
                .find_relation(relation_id)
                .await
                .map_err(internal)?;
            if let Some(mut relation) = relation {
                relation.members.retain(|member| *member != id);
                self.session.merge_relation(relation);
            }
        }

        self.session.remove(id);
        self.session.flush().await.map_err(write_failure)?;
        info!(person_id = %id, "person deleted");
        Ok(Outcome::Search)
    }

    /// Starts a new search from the first page. Does not query.
    pub fn search(&mut self) {
        self.page = 0;
    }

    pub async fn paginate(&mut self) -> Result<(), ApiError> {
        let predicates = search_predicates(&self.example);
        let limit = i64::from(PAGE_SIZE);
        let offset = i64::from(self.page) * limit;

        self.count = self.session.count(&predicates).await.map_err(internal)?;
        self.page_items = self
            .session
            .select_page(&predicates, offset, limit)
            .await
            .map_err(internal)?;
        debug!(
            count = self.count,
            page = self.page,
            items = self.page_items.len(),
            "search page loaded"
        );
        Ok(())
    }

    pub fn search_predicates(&self) -> Vec<Predicate> {
        search_predicates(&self.example)
    }

    pub async fn list_all(&self) -> Result<Vec<Person>, ApiError> {
        self.session.select_all().await.map_err(internal)
    }

    pub async fn list_relations(&self) -> Result<Vec<Relation>, ApiError> {
        self.session.list_relations().await.map_err(internal)
    }

    pub async fn resolve_key(&mut self, key: &str) -> Result<Option<Person>, ApiError> {
        resolve_by_key(&mut self.session, key).await
    }

    pub fn add(&self) -> &Person {
        &self.add
    }

    pub fn add_mut(&mut self) -> &mut Person {
        &mut self.add
    }

    /// Hands out the scratch person prepared for a new relation member and
    /// starts a fresh one.
    pub fn take_new_child_template(&mut self) -> Person {
        std::mem::take(&mut self.add)
    }

    fn begin_scope(&mut self) {
        self.session.close();
        self.scope = EditScope::Active;
        debug!("edit scope opened");
    }

    fn end_scope(&mut self) {
        self.scope = EditScope::Inactive;
        debug!("edit scope ended");
    }

    fn report(&mut self, err: ApiError) {
        warn!(code = ?err.code, message = %err.message, "write rejected");
        self.messages.push(UserMessage::error(err.message));
    }
}

/// Builds the AND-combined filter for `example`. Empty fields add nothing,
/// so an empty example matches every person.
pub fn search_predicates(example: &Person) -> Vec<Predicate> {
    let mut predicates = Vec::new();

    if !example.firstname.is_empty() {
        predicates.push(Predicate::contains(
            PersonField::Firstname,
            example.firstname.as_str(),
        ));
    }
    if !example.lastname.is_empty() {
        predicates.push(Predicate::contains(
            PersonField::Lastname,
            example.lastname.as_str(),
        ));
    }
    if let Some(relation) = example.relation {
        predicates.push(Predicate::equals_id(PersonField::Relation, relation.0));
    }

    predicates
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

fn write_failure(err: anyhow::Error) -> ApiError {
    let code = if is_constraint_violation(&err) {
        ErrorCode::Conflict
    } else {
        ErrorCode::Internal
    };
    ApiError::new(code, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
