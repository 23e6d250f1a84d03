use super::*;
use storage::Storage;

async fn open_session() -> PersistenceSession<Storage> {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    PersistenceSession::open(storage)
}

#[tokio::test]
async fn found_people_become_managed_until_close() {
    let mut session = open_session().await;
    let stored = session
        .store()
        .insert_person(&Person::new("Ann", "Lee"))
        .await
        .expect("insert");

    assert!(!session.contains(&stored));
    let found = session
        .find(stored.uid.expect("uid"))
        .await
        .expect("find")
        .expect("exists");
    assert!(session.contains(&found));

    session.close();
    assert!(!session.contains(&found));
}

#[tokio::test]
async fn new_people_are_not_managed() {
    let session = open_session().await;
    assert!(!session.contains(&Person::new("Nia", "Cole")));
}

#[tokio::test]
async fn flush_inserts_and_manages_persisted_people() {
    let mut session = open_session().await;
    session
        .persist(Person::new("Bob", "Lee"))
        .expect("persist");
    assert_eq!(session.pending_writes(), 1);
    assert_eq!(session.count(&[]).await.expect("count"), 0);

    session.flush().await.expect("flush");
    assert_eq!(session.pending_writes(), 0);

    let all = session.select_all().await.expect("all");
    assert_eq!(all.len(), 1);
    assert!(session.contains(&all[0]));
}

#[tokio::test]
async fn persist_rejects_people_that_already_have_an_id() {
    let mut session = open_session().await;
    let detached = Person {
        uid: Some(PersonId(5)),
        ..Person::new("Old", "Row")
    };
    assert!(session.persist(detached).is_err());
    assert_eq!(session.pending_writes(), 0);
}

#[tokio::test]
async fn merge_requires_an_id() {
    let mut session = open_session().await;
    assert!(session.merge(Person::new("No", "Id")).is_err());
}

#[tokio::test]
async fn failed_flush_drops_the_queue() {
    let mut session = open_session().await;
    session.remove(PersonId(77));
    session.flush().await.expect_err("nothing to delete");
    assert_eq!(session.pending_writes(), 0);
    session.flush().await.expect("empty flush");
}

#[tokio::test]
async fn merging_relation_updates_managed_members() {
    let mut session = open_session().await;
    let relation_id = session
        .store()
        .create_relation("team")
        .await
        .expect("relation");
    let stored = session
        .store()
        .insert_person(&Person::new("Tom", "Ash").with_relation(relation_id))
        .await
        .expect("insert");
    let uid = stored.uid.expect("uid");
    session.find(uid).await.expect("find");

    let mut relation = session
        .find_relation(relation_id)
        .await
        .expect("relation")
        .expect("exists");
    relation.members.retain(|member| *member != uid);
    session.merge_relation(relation);

    let cached = session.find(uid).await.expect("find").expect("cached");
    assert_eq!(cached.relation, None);
}
