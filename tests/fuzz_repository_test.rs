//! Randomized tests with a real SQLite database.
//!
//! Random values and page windows go through the full compile, bind and
//! decode path.

use multidb_repository::models::ConnectionDescriptor;
use multidb_repository::{
    ConnectionRegistry, Entity, Field, Mapper, PageRequest, Repository, RepositoryFactory,
};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Note {
    id: i64,
    body: String,
    weight: i64,
}

impl Entity for Note {
    const TABLE: &'static str = "notes";
}

impl Note {
    const BODY: Field<Note> = Field::new("body");
    const WEIGHT: Field<Note> = Field::new("weight");
}

async fn setup() -> (NamedTempFile, Repository) {
    let file = NamedTempFile::new().unwrap();
    let url = format!("sqlite:{}", file.path().display());
    let registry = ConnectionRegistry::from_descriptors([
        ConnectionDescriptor::new("Default", &url, None).unwrap(),
    ]);
    let factory = RepositoryFactory::with_sqlx(registry, Arc::new(Mapper::empty()));
    let repo = factory.get_default().await.unwrap().as_ref().clone();
    repo.execute_raw(
        "CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT NOT NULL, weight INTEGER NOT NULL)",
        vec![],
    )
    .await
    .unwrap();
    (file, repo)
}

#[tokio::test]
async fn fuzz_strings_round_trip() {
    let (_file, repo) = setup().await;
    let specials = ["", "'", "\"", "%", "_", "O'Brien", "a\nb", "🦀 crab", "NULL", "$1", "?"];

    for body in specials
        .iter()
        .map(|s| s.to_string())
        .chain((1..=30).map(|i| random_string(i * 3)))
    {
        let note = repo
            .insert(&Note {
                id: 0,
                body: body.clone(),
                weight: 1,
            })
            .await
            .unwrap();
        let loaded = repo.first(&Note::BODY.eq(body.as_str())).await.unwrap();
        assert_eq!(loaded.map(|n| n.id), Some(note.id), "body {:?}", body);
    }
}

#[tokio::test]
async fn fuzz_random_page_windows() {
    let (_file, repo) = setup().await;
    let mut rng = rand::thread_rng();

    let total: usize = rng.gen_range(1..120);
    let notes: Vec<Note> = (0..total)
        .map(|_| Note {
            id: 0,
            body: random_string(8),
            weight: rng.gen_range(-50..50),
        })
        .collect();
    assert!(repo.insert_many(&notes, rng.gen_bool(0.5)).await.unwrap());

    let threshold: i64 = rng.gen_range(-50..50);
    let predicate = Note::WEIGHT.ge(threshold);
    let expected = notes.iter().filter(|n| n.weight >= threshold).count() as u64;

    for _ in 0..10 {
        let size: u32 = rng.gen_range(1..30);
        let mut seen = 0u64;
        let mut last_weight = i64::MIN;
        let mut number = 1;
        loop {
            let page = repo
                .query_paged(PageRequest::new(number, size), Some(&predicate), Some(Note::WEIGHT), false)
                .await
                .unwrap();
            assert_eq!(page.total_count, expected);
            assert!(page.items.len() <= size as usize);
            for note in &page.items {
                assert!(note.weight >= last_weight);
                last_weight = note.weight;
            }
            seen += page.items.len() as u64;
            if !page.has_next_page() {
                break;
            }
            number += 1;
        }
        assert_eq!(seen, expected);
    }
}
