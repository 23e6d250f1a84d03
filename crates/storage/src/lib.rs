use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    error::ErrorKind,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::domain::{Address, AddressId, Person, PersonId, Relation, RelationId};

pub mod filter;

use filter::{push_where, Predicate};

const PERSON_COLUMNS: &str = "SELECT p.id, p.firstname, p.lastname, p.relation_id, p.created_at,
        a.id, a.street, a.city, a.zip
     FROM people p
     LEFT JOIN addresses a ON a.person_id = p.id";

/// A write queued by a unit of work and applied when it flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    InsertPerson(Person),
    UpdatePerson(Person),
    UpdateAddress(Address),
    UpdateRelation(Relation),
    DeletePerson(PersonId),
}

/// The persistence boundary for the person aggregate.
#[async_trait]
pub trait PersonStore: Send + Sync {
    async fn find_person(&self, id: PersonId) -> Result<Option<Person>>;
    async fn find_relation(&self, id: RelationId) -> Result<Option<Relation>>;
    async fn count_people(&self, filter: &[Predicate]) -> Result<i64>;
    async fn select_people(
        &self,
        filter: &[Predicate],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Person>>;
    async fn select_all_people(&self) -> Result<Vec<Person>>;
    async fn list_relations(&self) -> Result<Vec<Relation>>;
    /// Applies `writes` in order inside one transaction. Returns the inserted
    /// people, with their assigned ids, in insertion order.
    async fn apply_writes(&self, writes: &[PendingWrite]) -> Result<Vec<Person>>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens its own empty database.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_relation(&self, name: &str) -> Result<RelationId> {
        let rec = sqlx::query("INSERT INTO relations (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to create relation '{name}'"))?;
        Ok(RelationId(rec.get::<i64, _>(0)))
    }

    pub async fn insert_person(&self, person: &Person) -> Result<Person> {
        let mut inserted = self
            .apply_writes(&[PendingWrite::InsertPerson(person.clone())])
            .await?;
        inserted
            .pop()
            .context("insert did not return the stored person")
    }
}

#[async_trait]
impl PersonStore for Storage {
    async fn find_person(&self, id: PersonId) -> Result<Option<Person>> {
        let row = sqlx::query(&format!("{PERSON_COLUMNS} WHERE p.id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(person_from_row).transpose()
    }

    async fn find_relation(&self, id: RelationId) -> Result<Option<Relation>> {
        let row = sqlx::query("SELECT id, name FROM relations WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let members = relation_members(&self.pool, id).await?;
        Ok(Some(Relation {
            id: RelationId(row.get::<i64, _>(0)),
            name: row.get::<String, _>(1),
            members,
        }))
    }

    async fn count_people(&self, filter: &[Predicate]) -> Result<i64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM people p");
        push_where(&mut builder, filter);
        let count = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("failed to count people")?;
        Ok(count)
    }

    async fn select_people(
        &self,
        filter: &[Predicate],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Person>> {
        let mut builder = QueryBuilder::<Sqlite>::new(PERSON_COLUMNS);
        push_where(&mut builder, filter);
        builder.push(" ORDER BY p.id ASC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to select people page")?;
        rows.iter().map(person_from_row).collect()
    }

    async fn select_all_people(&self) -> Result<Vec<Person>> {
        let rows = sqlx::query(&format!("{PERSON_COLUMNS} ORDER BY p.id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(person_from_row).collect()
    }

    async fn list_relations(&self) -> Result<Vec<Relation>> {
        let rows = sqlx::query("SELECT id, name FROM relations ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut relations = Vec::with_capacity(rows.len());
        for row in rows {
            let id = RelationId(row.get::<i64, _>(0));
            relations.push(Relation {
                id,
                name: row.get::<String, _>(1),
                members: relation_members(&self.pool, id).await?,
            });
        }
        Ok(relations)
    }

    async fn apply_writes(&self, writes: &[PendingWrite]) -> Result<Vec<Person>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for write in writes {
            match write {
                PendingWrite::InsertPerson(person) => {
                    inserted.push(insert_person(&mut tx, person).await?);
                }
                PendingWrite::UpdatePerson(person) => update_person(&mut tx, person).await?,
                PendingWrite::UpdateAddress(address) => update_address(&mut tx, address).await?,
                PendingWrite::UpdateRelation(relation) => {
                    update_relation(&mut tx, relation).await?
                }
                PendingWrite::DeletePerson(id) => {
                    let removed = sqlx::query("DELETE FROM people WHERE id = ?")
                        .bind(id.0)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                    if removed == 0 {
                        bail!("person {id} no longer exists");
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

/// True when `err` was caused by the store rejecting a write on a unique,
/// foreign key, not-null or check constraint.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) => matches!(
            db.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        ),
        _ => false,
    })
}

async fn insert_person(tx: &mut Transaction<'static, Sqlite>, person: &Person) -> Result<Person> {
    let rec = sqlx::query(
        "INSERT INTO people (firstname, lastname, relation_id) VALUES (?, ?, ?)
         RETURNING id, created_at",
    )
    .bind(&person.firstname)
    .bind(&person.lastname)
    .bind(person.relation.map(|id| id.0))
    .fetch_one(&mut **tx)
    .await?;

    let uid = PersonId(rec.get::<i64, _>(0));
    let mut stored = person.clone();
    stored.uid = Some(uid);
    stored.created_at = Some(rec.get::<DateTime<Utc>, _>(1));

    if let Some(address) = stored.address.as_mut() {
        address.person = Some(uid);
        address.id = Some(insert_address(tx, address).await?);
    }

    Ok(stored)
}

async fn update_person(tx: &mut Transaction<'static, Sqlite>, person: &Person) -> Result<()> {
    let Some(uid) = person.uid else {
        bail!("cannot merge a person that has no id");
    };

    let updated = sqlx::query(
        "UPDATE people SET firstname = ?, lastname = ?, relation_id = ? WHERE id = ?",
    )
    .bind(&person.firstname)
    .bind(&person.lastname)
    .bind(person.relation.map(|id| id.0))
    .bind(uid.0)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if updated == 0 {
        bail!("person {uid} no longer exists");
    }

    if let Some(address) = &person.address {
        let mut address = address.clone();
        address.person = Some(uid);
        if address.id.is_some() {
            update_address(tx, &address).await?;
        } else {
            insert_address(tx, &address).await?;
        }
    }
    Ok(())
}

async fn insert_address(tx: &mut Transaction<'static, Sqlite>, address: &Address) -> Result<AddressId> {
    let rec = sqlx::query(
        "INSERT INTO addresses (street, city, zip, person_id) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(&address.street)
    .bind(&address.city)
    .bind(&address.zip)
    .bind(address.person.map(|id| id.0))
    .fetch_one(&mut **tx)
    .await?;
    Ok(AddressId(rec.get::<i64, _>(0)))
}

async fn update_address(tx: &mut Transaction<'static, Sqlite>, address: &Address) -> Result<()> {
    let Some(id) = address.id else {
        bail!("cannot merge an address that has no id");
    };

    let updated = sqlx::query(
        "UPDATE addresses SET street = ?, city = ?, zip = ?, person_id = ? WHERE id = ?",
    )
    .bind(&address.street)
    .bind(&address.city)
    .bind(&address.zip)
    .bind(address.person.map(|id| id.0))
    .bind(id.0)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if updated == 0 {
        bail!("address {id} no longer exists");
    }
    Ok(())
}

/// Writes the relation name and detaches every stored member that is no
/// longer listed in `relation.members`.
async fn update_relation(tx: &mut Transaction<'static, Sqlite>, relation: &Relation) -> Result<()> {
    let updated = sqlx::query("UPDATE relations SET name = ? WHERE id = ?")
        .bind(&relation.name)
        .bind(relation.id.0)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if updated == 0 {
        bail!("relation {} no longer exists", relation.id);
    }

    let mut builder =
        QueryBuilder::<Sqlite>::new("UPDATE people SET relation_id = NULL WHERE relation_id = ");
    builder.push_bind(relation.id.0);
    if !relation.members.is_empty() {
        builder.push(" AND id NOT IN (");
        let mut separated = builder.separated(", ");
        for member in &relation.members {
            separated.push_bind(member.0);
        }
        separated.push_unseparated(")");
    }
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

async fn relation_members(pool: &Pool<Sqlite>, id: RelationId) -> Result<Vec<PersonId>> {
    let rows = sqlx::query("SELECT id FROM people WHERE relation_id = ? ORDER BY id ASC")
        .bind(id.0)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| PersonId(r.get::<i64, _>(0)))
        .collect())
}

fn person_from_row(row: &SqliteRow) -> Result<Person> {
    let uid = PersonId(row.try_get::<i64, _>(0)?);
    let address = row
        .try_get::<Option<i64>, _>(5)?
        .map(|address_id| -> Result<Address> {
            Ok(Address {
                id: Some(AddressId(address_id)),
                street: row.try_get::<String, _>(6)?,
                city: row.try_get::<String, _>(7)?,
                zip: row.try_get::<String, _>(8)?,
                person: Some(uid),
            })
        })
        .transpose()?;

    Ok(Person {
        uid: Some(uid),
        firstname: row.try_get::<String, _>(1)?,
        lastname: row.try_get::<String, _>(2)?,
        address,
        relation: row.try_get::<Option<i64>, _>(3)?.map(RelationId),
        created_at: Some(row.try_get::<DateTime<Utc>, _>(4)?),
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
