use quarry::error::{DriverError, QuarryError};
use quarry::prelude::*;

use crate::common::{Event, Post, Script, User, router, user_row};

mod common;

const USER_INSERT: &str = "INSERT INTO users (name, email, age, profile_id, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6) RETURNING id AS new_id";

#[tokio::test]
async fn create_returns_the_record_with_its_new_key() {
    let script = Script::new();
    let router = router(&script).await;
    script.rows(vec![row! { "new_id" => 5 }]);

    let user = User::objects(&router)
        .unwrap()
        .create(row! { "name" => "Ann", "age" => 30 })
        .await
        .unwrap();

    assert_eq!(user.id, Some(5));
    assert_eq!(user.name, "Ann");
    assert!(user.created_at.is_some());
    assert_eq!(script.statements(), [USER_INSERT]);

    let params = script.params(0);
    assert_eq!(params[0], Value::from("Ann"));
    assert_eq!(params[1], Value::Null);
    assert_eq!(params[2], Value::Int(30));
    assert!(matches!(params[4], Value::TimestampTz(_)));

    let events = script.events();
    assert_eq!(events.first(), Some(&Event::Begin("primary".into())));
    assert_eq!(events.last(), Some(&Event::Commit("primary".into())));
}

#[tokio::test]
async fn create_validates_through_the_model() {
    let script = Script::new();
    let router = router(&script).await;

    let err = User::objects(&router)
        .unwrap()
        .create(row! { "age" => 30 })
        .await
        .unwrap_err();

    assert!(matches!(err, QuarryError::Decode(_)));
    assert!(script.events().is_empty());
}

#[tokio::test]
async fn unique_violation_is_a_duplicate_key_with_the_table() {
    let script = Script::new();
    let router = router(&script).await;
    script.error(
        DriverError::new("UniqueViolation", "duplicate key value violates unique constraint")
            .with_sqlstate("23505"),
    );

    let err = User::objects(&router)
        .unwrap()
        .create(row! { "name" => "Ann" })
        .await
        .unwrap_err();

    assert!(err.is_duplicate_key());
    assert!(matches!(&err, QuarryError::DuplicateKey { table, .. } if table.as_deref() == Some("users")));
    assert_eq!(script.events().last(), Some(&Event::Rollback("primary".into())));
}

#[tokio::test]
async fn other_write_failures_are_database_errors() {
    let script = Script::new();
    let router = router(&script).await;
    script.error(DriverError::new("ForeignKeyViolation", "no such profile").with_sqlstate("23503"));

    let err = User::objects(&router)
        .unwrap()
        .create(row! { "name" => "Ann", "profile_id" => 99 })
        .await
        .unwrap_err();

    match err {
        QuarryError::Database {
            name,
            sqlstate,
            message,
        } => {
            assert_eq!(name, "ForeignKeyViolation");
            assert_eq!(sqlstate, "23503");
            assert_eq!(message, "no such profile");
        }
        other => panic!("expected Database, got {other:?}"),
    }
}

#[tokio::test]
async fn conflict_do_nothing_leaves_the_key_unset() {
    let script = Script::new();
    let router = router(&script).await;
    script.rows(Vec::new());

    let post = Post::objects(&router)
        .unwrap()
        .create_with(
            row! { "user_id" => 1, "title" => "hello" },
            Some(OnConflict::DoNothing),
        )
        .await
        .unwrap();

    assert_eq!(post.id, None);
    assert_eq!(
        script.statements(),
        ["INSERT INTO posts (user_id, title) VALUES ($1, $2) ON CONFLICT DO NOTHING RETURNING id AS new_id"]
    );
}

#[tokio::test]
async fn conflict_update_needs_targets_and_fields() {
    let script = Script::new();
    let router = router(&script).await;

    let err = Post::objects(&router)
        .unwrap()
        .create_with(
            row! { "user_id" => 1, "title" => "hello" },
            Some(OnConflict::update(Vec::<&str>::new(), ["title"])),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, QuarryError::MalformedQueryset { .. }));
    assert!(script.events().is_empty());
}

// ==================== bulk_create ====================

#[tokio::test]
async fn bulk_create_runs_in_one_transaction() {
    let script = Script::new();
    let router = router(&script).await;
    script
        .rows(vec![row! { "new_id" => 1 }])
        .rows(vec![row! { "new_id" => 2 }]);

    let created = Post::objects(&router)
        .unwrap()
        .bulk_create(
            vec![
                row! { "user_id" => 1, "title" => "a" },
                row! { "user_id" => 2, "title" => "b" },
            ],
            BulkOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(created, 2);
    let insert = "INSERT INTO posts (user_id, title) VALUES ($1, $2) RETURNING id AS new_id";
    assert_eq!(script.statements(), [insert, insert]);
    let events = script.events();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0], Event::Begin("primary".into()));
    assert_eq!(events[3], Event::Commit("primary".into()));
}

#[tokio::test]
async fn bulk_create_with_conflict_update() {
    let script = Script::new();
    let router = router(&script).await;

    Post::objects(&router)
        .unwrap()
        .bulk_create(
            vec![row! { "id" => 7, "user_id" => 1, "title" => "a" }],
            BulkOptions {
                skip_validation: true,
                on_conflict: Some(OnConflict::update(["id"], ["title"])),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        script.statements(),
        ["INSERT INTO posts (user_id, title) VALUES ($1, $2) \
          ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title RETURNING id AS new_id"]
    );
}

#[tokio::test]
async fn bulk_create_of_nothing_fails_before_io() {
    let script = Script::new();
    let router = router(&script).await;

    let err = Post::objects(&router)
        .unwrap()
        .bulk_create(Vec::new(), BulkOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QuarryError::NothingToCreate));
    assert!(script.events().is_empty());
}

#[tokio::test]
async fn bulk_create_requires_uniform_columns() {
    let script = Script::new();
    let router = router(&script).await;

    let err = Post::objects(&router)
        .unwrap()
        .bulk_create(
            vec![
                row! { "user_id" => 1, "title" => "a" },
                row! { "user_id" => 2 },
            ],
            BulkOptions {
                skip_validation: true,
                on_conflict: None,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(&err, QuarryError::MalformedQueryset { reason, .. } if reason.contains("title")));
    assert!(script.events().is_empty());
}

// ==================== get_or_create / update_or_create ====================

#[tokio::test]
async fn get_or_create_returns_an_existing_row() {
    let script = Script::new();
    let router = router(&script).await;
    script.rows(vec![user_row(1, "Ann", 30)]);

    let (user, created) = User::objects(&router)
        .unwrap()
        .get_or_create(filters! { "name" => "Ann" }, row! { "age" => 99 })
        .await
        .unwrap();

    assert!(!created);
    assert_eq!(user.age, Some(30));
    assert_eq!(script.statements().len(), 1);
}

#[tokio::test]
async fn get_or_create_creates_from_lookup_and_defaults() {
    let script = Script::new();
    let router = router(&script).await;
    script.rows(Vec::new()).rows(vec![row! { "new_id" => 9 }]);

    let (user, created) = User::objects(&router)
        .unwrap()
        .get_or_create(
            filters! { "email" => "ann@example.com", "age__gte" => 18 },
            row! { "name" => "Ann", "age" => 30 },
        )
        .await
        .unwrap();

    assert!(created);
    assert_eq!(user.id, Some(9));
    assert_eq!(user.email.as_deref(), Some("ann@example.com"));
    assert_eq!(user.age, Some(30));
    assert_eq!(script.statements()[1], USER_INSERT);
}

#[tokio::test]
async fn get_or_create_does_not_swallow_multiple_results() {
    let script = Script::new();
    let router = router(&script).await;
    script.rows(vec![user_row(1, "Ann", 30), user_row(2, "Ann", 40)]);

    let err = User::objects(&router)
        .unwrap()
        .get_or_create(filters! { "name" => "Ann" }, Row::new())
        .await
        .unwrap_err();

    assert!(matches!(err, QuarryError::MultipleResultsFound { .. }));
    assert_eq!(script.statements().len(), 1);
}

#[tokio::test]
async fn update_or_create_saves_defaults_over_a_hit() {
    let script = Script::new();
    let router = router(&script).await;
    script
        .rows(vec![user_row(1, "Ann", 30)])
        .rows(vec![row! { "updated_count" => 1 }]);

    let (user, created) = User::objects(&router)
        .unwrap()
        .update_or_create(filters! { "id" => 1 }, row! { "age" => 31 })
        .await
        .unwrap();

    assert!(!created);
    assert_eq!(user.age, Some(31));
    assert!(user.updated_at.is_some());
    assert_eq!(
        script.statements()[1],
        "WITH updated AS (UPDATE users t SET name = $1, email = $2, age = $3, profile_id = $4, \
         created_at = $5, updated_at = $6 WHERE t.id = $7 RETURNING id AS updated_id) \
         SELECT COUNT(*) AS updated_count FROM updated"
    );
    assert_eq!(script.params(1)[2], Value::Int(31));
    assert_eq!(script.params(1)[6], Value::Int(1));
}

#[tokio::test]
async fn update_or_create_creates_on_a_miss() {
    let script = Script::new();
    let router = router(&script).await;
    script.rows(Vec::new()).rows(vec![row! { "new_id" => 3 }]);

    let (user, created) = User::objects(&router)
        .unwrap()
        .update_or_create(filters! { "name" => "Cy" }, row! { "age" => 20 })
        .await
        .unwrap();

    assert!(created);
    assert_eq!(user.id, Some(3));
    assert_eq!(user.name, "Cy");
}
