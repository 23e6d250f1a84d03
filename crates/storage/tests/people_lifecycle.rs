use shared::domain::{Address, Person};
use storage::{PendingWrite, PersonStore, Storage};

#[tokio::test]
async fn unlink_then_remove_deletes_person_and_keeps_address() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let friends = storage.create_relation("friends").await.expect("relation");
    let stored = storage
        .insert_person(
            &Person::new("Gil", "Hart")
                .with_relation(friends)
                .with_address(Address::new("3 Hill", "Vale", "333")),
        )
        .await
        .expect("insert");
    let uid = stored.uid.expect("uid");

    let mut address = stored.address.clone().expect("address");
    address.person = None;
    let mut relation = storage
        .find_relation(friends)
        .await
        .expect("find relation")
        .expect("relation exists");
    relation.members.retain(|member| *member != uid);

    storage
        .apply_writes(&[
            PendingWrite::UpdateAddress(address),
            PendingWrite::UpdateRelation(relation),
            PendingWrite::DeletePerson(uid),
        ])
        .await
        .expect("delete sequence");

    assert!(storage.find_person(uid).await.expect("find").is_none());
    let relation = storage
        .find_relation(friends)
        .await
        .expect("find relation")
        .expect("relation exists");
    assert!(relation.members.is_empty());

    let orphaned: Option<i64> =
        sqlx::query_scalar("SELECT person_id FROM addresses WHERE street = '3 Hill'")
            .fetch_one(storage.pool())
            .await
            .expect("address row");
    assert_eq!(orphaned, None);
}
