//! Search filters over people, expressed as an ordered list of predicates
//! that are AND-combined when translated to SQL.

use sqlx::{QueryBuilder, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonField {
    Firstname,
    Lastname,
    Relation,
}

impl PersonField {
    fn column(self) -> &'static str {
        match self {
            PersonField::Firstname => "p.firstname",
            PersonField::Lastname => "p.lastname",
            PersonField::Relation => "p.relation_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Case-sensitive substring match.
    Contains,
    Equals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Id(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub field: PersonField,
    pub operator: Operator,
    pub value: FilterValue,
}

impl Predicate {
    pub fn contains(field: PersonField, text: impl Into<String>) -> Self {
        Self {
            field,
            operator: Operator::Contains,
            value: FilterValue::Text(text.into()),
        }
    }

    pub fn equals_id(field: PersonField, id: i64) -> Self {
        Self {
            field,
            operator: Operator::Equals,
            value: FilterValue::Id(id),
        }
    }
}

/// Appends ` WHERE a AND b ...` for `predicates`; appends nothing when empty.
pub(crate) fn push_where(builder: &mut QueryBuilder<'_, Sqlite>, predicates: &[Predicate]) {
    for (index, predicate) in predicates.iter().enumerate() {
        builder.push(if index == 0 { " WHERE " } else { " AND " });
        builder.push(predicate.field.column());
        match (predicate.operator, &predicate.value) {
            (Operator::Contains, FilterValue::Text(text)) => {
                builder.push(" GLOB ");
                builder.push_bind(contains_pattern(text));
            }
            (Operator::Contains, FilterValue::Id(id)) => {
                builder.push(" GLOB ");
                builder.push_bind(contains_pattern(&id.to_string()));
            }
            (Operator::Equals, FilterValue::Text(text)) => {
                builder.push(" = ");
                builder.push_bind(text.clone());
            }
            (Operator::Equals, FilterValue::Id(id)) => {
                builder.push(" = ");
                builder.push_bind(*id);
            }
        }
    }
}

/// Wraps `text` in glob wildcards. GLOB compares case-sensitively, unlike
/// SQLite's LIKE, and metacharacters in `text` are bracketed so they match
/// literally.
pub(crate) fn contains_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('*');
    for ch in text.chars() {
        match ch {
            '*' | '?' | '[' => {
                pattern.push('[');
                pattern.push(ch);
                pattern.push(']');
            }
            _ => pattern.push(ch),
        }
    }
    pattern.push('*');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_plain_text_in_wildcards() {
        assert_eq!(contains_pattern("Lee"), "*Lee*");
    }

    #[test]
    fn brackets_glob_metacharacters() {
        assert_eq!(contains_pattern("a*b?[c"), "*a[*]b[?][[]c*");
    }

    #[test]
    fn empty_predicate_list_adds_no_where_clause() {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM people p");
        push_where(&mut builder, &[]);
        assert_eq!(builder.sql(), "SELECT COUNT(*) FROM people p");
    }

    #[test]
    fn predicates_are_and_combined_in_order() {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM people p");
        push_where(
            &mut builder,
            &[
                Predicate::contains(PersonField::Firstname, "An"),
                Predicate::contains(PersonField::Lastname, "Lee"),
                Predicate::equals_id(PersonField::Relation, 3),
            ],
        );
        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM people p WHERE p.firstname GLOB ? AND p.lastname GLOB ? AND p.relation_id = ?"
        );
    }
}
