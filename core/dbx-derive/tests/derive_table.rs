//! derive(Table) 매크로 테스트

use dbx_cluster::mapping::Mapped;
use dbx_cluster::schema::{ColumnMetadata, ColumnType, Row, TableMetadata, Value};
use dbx_derive::Table;

#[derive(Table, Debug, PartialEq)]
#[dbx(table_name = "users")]
pub struct User {
    pub id: i64,
    #[dbx(column = "full_name")]
    pub name: String,
    pub age: i32,
    pub email: Option<String>,
}

#[derive(Table)]
pub struct Counter {
    pub id: u32,
}

fn users() -> TableMetadata {
    TableMetadata::new(
        "test",
        "users",
        vec![
            ColumnMetadata::new("id", ColumnType::BigInt).primary_key(),
            ColumnMetadata::new("full_name", ColumnType::Varchar(32)),
            ColumnMetadata::new("age", ColumnType::Int),
            ColumnMetadata::new("email", ColumnType::Varchar(64)).nullable(),
        ],
        vec![],
    )
    .unwrap()
}

#[test]
fn test_table_name() {
    assert_eq!(User::TABLE_NAME, "users");
    assert_eq!(Counter::TABLE_NAME, "counter");
}

#[test]
fn test_field_names_follow_column_attribute() {
    assert_eq!(User::field_names(), &["id", "full_name", "age", "email"]);
}

#[test]
fn test_to_row_places_values_by_column() {
    let table = users();
    let user = User {
        id: 1,
        name: "Alice".to_string(),
        age: 30,
        email: None,
    };
    let row = user.to_row(&table).unwrap();
    assert_eq!(row.get(0), Some(&Value::Int(1)));
    assert_eq!(row.get(1), Some(&Value::Text("Alice".to_string())));
    assert_eq!(row.get(3), Some(&Value::Null));
}

#[test]
fn test_from_row() {
    let table = users();
    let row = Row::from_values(vec![
        Value::Int(2),
        Value::Text("Bob".to_string()),
        Value::Int(25),
        Value::Text("bob@example.com".to_string()),
    ]);
    let user = User::from_row(&table, &row).unwrap();
    assert_eq!(
        user,
        User {
            id: 2,
            name: "Bob".to_string(),
            age: 25,
            email: Some("bob@example.com".to_string()),
        }
    );
}

#[test]
fn test_unknown_column_is_reported() {
    let table = TableMetadata::new(
        "test",
        "users",
        vec![ColumnMetadata::new("id", ColumnType::BigInt).primary_key()],
        vec![],
    )
    .unwrap();
    let user = User {
        id: 1,
        name: String::new(),
        age: 0,
        email: None,
    };
    assert!(user.to_row(&table).is_err());
}
