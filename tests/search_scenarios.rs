//! End-to-end write/query scenarios against one collection.

use std::sync::Arc;

use canopy::config::{Config, READ_MODE};
use canopy::directory::Directory;
use canopy::docs::FieldValue;
use canopy::error::Result;
use canopy::model::{SimilarityModel, TextModel};
use canopy::query::{Clause, Occur, Query, QueryParser};
use canopy::session::{QuerySession, WriteSession};

fn index_titles(dir: &tempfile::TempDir, collection: &str, titles: &[&str]) -> Result<Arc<Directory>> {
    let directory = Arc::new(Directory::open(dir.path())?);
    let model = Arc::new(TextModel::new());
    let collection_id = directory.collection_id(collection);

    let mut session = WriteSession::new(
        collection_id,
        Arc::clone(&directory),
        model as Arc<dyn SimilarityModel>,
        &Config::new(),
    )?;
    for (i, title) in titles.iter().enumerate() {
        session.put(vec![
            ("id".into(), FieldValue::Integer(i as i64 + 1)),
            ("title".into(), FieldValue::Text((*title).into())),
        ])?;
    }
    session.flush()?;

    Ok(directory)
}

fn query_session(directory: &Arc<Directory>, collection: &str, mode: &str) -> QuerySession {
    let mut config = Config::new();
    config.set(READ_MODE, mode);

    QuerySession::new(
        directory.collection_id(collection),
        Arc::clone(directory),
        Arc::new(TextModel::new()) as Arc<dyn SimilarityModel>,
        config,
    )
}

fn stored_id(fields: &[(String, FieldValue)]) -> i64 {
    fields
        .iter()
        .find_map(|(name, value)| match (name.as_str(), value) {
            ("id", FieldValue::Integer(id)) => Some(*id),
            _ => None,
        })
        .expect("document stores an id field")
}

#[test]
fn exact_term_wins_over_its_fold_cluster() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let directory = index_titles(&dir, "books", &["cat", "bat", "cab"])?;

    for mode in ["buffered", "mmap"] {
        let session = query_session(&directory, "books", mode);

        // "cat", "bat", and "cab" are pairwise fold-related under the text
        // model, so they share one cluster chain; an exact query must still
        // resolve to its own node's postings.
        let result = session.query(&Query::new(vec![Clause::term(
            Occur::Must,
            "title",
            "cat",
        )]))?;
        assert_eq!(result.total, 1, "{mode} mode");
        assert_eq!(stored_id(&result.documents[0].fields), 1);

        let result = session.query(&Query::new(vec![Clause::term(
            Occur::Must,
            "title",
            "bat",
        )]))?;
        assert_eq!(result.total, 1, "{mode} mode");
        assert_eq!(stored_id(&result.documents[0].fields), 2);
    }

    Ok(())
}

#[test]
fn should_clauses_reward_documents_matching_more_terms() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let directory = index_titles(&dir, "books", &["cat bat", "cat", "bat"])?;

    let session = query_session(&directory, "books", "buffered");
    let result = session.query(&Query::new(vec![
        Clause::term(Occur::Should, "title", "cat"),
        Clause::term(Occur::Should, "title", "bat"),
    ]))?;

    assert_eq!(result.total, 3);
    // The double match scores max(1,1) + (1+1)/2 = 2, above either single.
    assert_eq!(stored_id(&result.documents[0].fields), 1);
    assert!((result.documents[0].score - 2.0).abs() < 1e-6);
    assert!(result.documents[1].score < result.documents[0].score);

    Ok(())
}

#[test]
fn must_not_removes_and_phrase_sums_tokens() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let directory = index_titles(&dir, "books", &["cat bat", "cat", "bat"])?;
    let session = query_session(&directory, "books", "buffered");

    let result = session.query(&Query::new(vec![
        Clause::term(Occur::Should, "title", "cat"),
        Clause::term(Occur::MustNot, "title", "bat"),
    ]))?;
    assert_eq!(result.total, 1);
    assert_eq!(stored_id(&result.documents[0].fields), 2);

    let result = session.query(&Query::new(vec![Clause::phrase(
        Occur::Should,
        "title",
        "cat bat",
    )]))?;
    assert_eq!(result.total, 3);
    assert_eq!(stored_id(&result.documents[0].fields), 1);
    assert!((result.documents[0].score - 2.0).abs() < 1e-6);

    Ok(())
}

#[test]
fn window_clamps_and_zero_take_means_all() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let directory = index_titles(&dir, "books", &["cat", "cat", "cat"])?;
    let session = query_session(&directory, "books", "buffered");

    let all = Query::new(vec![Clause::term(Occur::Must, "title", "cat")]);
    let result = session.query(&all.clone().with_window(0, 0))?;
    assert_eq!(result.total, 3);
    assert_eq!(result.documents.len(), 3);

    let result = session.query(&all.clone().with_window(2, 100))?;
    assert_eq!(result.total, 3);
    assert_eq!(result.documents.len(), 1);

    let result = session.query(&all.with_window(50, 10))?;
    assert_eq!(result.total, 3);
    assert!(result.documents.is_empty());

    Ok(())
}

#[test]
fn missing_column_contributes_no_matches() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let directory = index_titles(&dir, "books", &["cat"])?;
    let session = query_session(&directory, "books", "buffered");

    let result = session.query(&Query::new(vec![Clause::term(
        Occur::Must,
        "subtitle",
        "cat",
    )]))?;
    assert_eq!(result.total, 0);

    // An AND across a present and a missing column empties the result.
    let result = session.query(&Query::new(vec![
        Clause::term(Occur::Must, "title", "cat"),
        Clause::term(Occur::Must, "subtitle", "cat"),
    ]))?;
    assert_eq!(result.total, 0);

    Ok(())
}

#[test]
fn parsed_queries_select_fields() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let directory = index_titles(&dir, "books", &["cat", "bat"])?;
    let session = query_session(&directory, "books", "buffered");

    let query = QueryParser::new("title")
        .parse("+title:cat")?
        .with_select(vec!["title".into()]);
    let result = session.query(&query)?;

    assert_eq!(result.total, 1);
    let fields = &result.documents[0].fields;
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].0, "title");

    Ok(())
}
