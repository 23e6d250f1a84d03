use std::collections::HashMap;

use anyhow::{bail, Result};
use shared::domain::{Address, Person, PersonId, Relation, RelationId};
use storage::{filter::Predicate, PendingWrite, PersonStore};

/// Unit of work for one conversation.
///
/// People loaded through [`find`](Self::find) or inserted by a flush are
/// *managed*: the session tracks them by id until it is closed. Writes are
/// queued and only reach the store on [`flush`](Self::flush), in one
/// transaction and in the order they were queued.
pub struct PersistenceSession<S: PersonStore> {
    store: S,
    managed: HashMap<PersonId, Person>,
    pending: Vec<PendingWrite>,
}

impl<S: PersonStore> PersistenceSession<S> {
    pub fn open(store: S) -> Self {
        Self {
            store,
            managed: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn find(&mut self, id: PersonId) -> Result<Option<Person>> {
        if let Some(person) = self.managed.get(&id) {
            return Ok(Some(person.clone()));
        }

        let found = self.store.find_person(id).await?;
        if let Some(person) = &found {
            self.managed.insert(id, person.clone());
        }
        Ok(found)
    }

    pub async fn find_relation(&self, id: RelationId) -> Result<Option<Relation>> {
        self.store.find_relation(id).await
    }

    pub fn contains(&self, person: &Person) -> bool {
        person
            .uid
            .is_some_and(|uid| self.managed.contains_key(&uid))
    }

    pub fn persist(&mut self, person: Person) -> Result<()> {
        if let Some(uid) = person.uid {
            bail!("person {uid} is detached and cannot be persisted again");
        }
        self.pending.push(PendingWrite::InsertPerson(person));
        Ok(())
    }

    pub fn merge(&mut self, person: Person) -> Result<()> {
        let Some(uid) = person.uid else {
            bail!("cannot merge a person that was never persisted");
        };
        self.managed.insert(uid, person.clone());
        self.pending.push(PendingWrite::UpdatePerson(person));
        Ok(())
    }

    pub fn merge_address(&mut self, address: Address) {
        for person in self.managed.values_mut() {
            let holds_address = person
                .address
                .as_ref()
                .is_some_and(|held| held.id.is_some() && held.id == address.id);
            if holds_address {
                person.address = (address.person == person.uid).then(|| address.clone());
            }
        }
        self.pending.push(PendingWrite::UpdateAddress(address));
    }

    pub fn merge_relation(&mut self, relation: Relation) {
        for person in self.managed.values_mut() {
            let dropped = person.relation == Some(relation.id)
                && !person
                    .uid
                    .is_some_and(|uid| relation.members.contains(&uid));
            if dropped {
                person.relation = None;
            }
        }
        self.pending.push(PendingWrite::UpdateRelation(relation));
    }

    pub fn remove(&mut self, id: PersonId) {
        self.managed.remove(&id);
        self.pending.push(PendingWrite::DeletePerson(id));
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Applies queued writes. The queue is emptied whether or not the store
    /// accepts them.
    pub async fn flush(&mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.pending);
        if writes.is_empty() {
            return Ok(());
        }

        let inserted = self.store.apply_writes(&writes).await?;
        for person in inserted {
            if let Some(uid) = person.uid {
                self.managed.insert(uid, person);
            }
        }
        Ok(())
    }

    /// Forgets every managed person and drops unflushed writes.
    pub fn close(&mut self) {
        self.managed.clear();
        self.pending.clear();
    }

    pub async fn count(&self, filter: &[Predicate]) -> Result<i64> {
        self.store.count_people(filter).await
    }

    pub async fn select_page(
        &self,
        filter: &[Predicate],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Person>> {
        self.store.select_people(filter, offset, limit).await
    }

    pub async fn select_all(&self) -> Result<Vec<Person>> {
        self.store.select_all_people().await
    }

    pub async fn list_relations(&self) -> Result<Vec<Relation>> {
        self.store.list_relations().await
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
