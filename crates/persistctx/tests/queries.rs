//! Queries against the in-memory backend, merged with the identity map.

mod common;

use common::{Person, context, seeded_backend};
use persistctx::prelude::*;
use persistctx::{Statement, StatementKind};
use std::rc::Rc;

fn names(people: &[EntityRef<Person>]) -> Vec<String> {
    people.iter().map(|p| p.borrow().name.clone()).collect()
}

fn commit_mode() -> PersistenceContext<MemoryBackend> {
    PersistenceContext::with_config(
        seeded_backend(),
        PersistenceUnitConfig::new().flush_mode(FlushMode::Commit),
    )
}

/// Optional criteria, applied only when present.
fn search(
    ctx: &mut PersistenceContext<MemoryBackend>,
    name: Option<&str>,
    min_age: Option<i32>,
) -> Result<Vec<EntityRef<Person>>> {
    let query = Query::<Person>::new()
        .filter_opt(name.map(|n| Condition::col("name").like(n)))
        .filter_opt(min_age.map(|a| Condition::col("age").ge(a)))
        .order_by(OrderBy::asc("id"));
    ctx.query_list(&query)
}

#[test]
fn filter_order_and_limit() {
    let mut ctx = context(seeded_backend());
    let adults = ctx
        .query_list(
            &Query::<Person>::new()
                .filter(Condition::col("age").ge(18))
                .order_by(OrderBy::desc("name")),
        )
        .unwrap();
    assert_eq!(names(&adults), ["carla", "alice"]);

    let page = ctx
        .query_list(
            &Query::<Person>::new()
                .order_by(OrderBy::asc("age"))
                .offset(1)
                .limit(1),
        )
        .unwrap();
    assert_eq!(names(&page), ["carla"]);
}

#[test]
fn optional_criteria() {
    let mut ctx = context(seeded_backend());
    assert_eq!(
        names(&search(&mut ctx, None, None).unwrap()),
        ["alice", "bruno", "carla"]
    );
    assert_eq!(names(&search(&mut ctx, Some("b%"), None).unwrap()), ["bruno"]);
    assert_eq!(
        names(&search(&mut ctx, Some("%a"), Some(18)).unwrap()),
        ["carla"]
    );
}

#[test]
fn query_results_share_identity() {
    let mut ctx = context(seeded_backend());
    let all = ctx.query_list(&Query::<Person>::new()).unwrap();
    let again = ctx.query_list(&Query::<Person>::new()).unwrap();
    assert!(all.iter().zip(&again).all(|(a, b)| Rc::ptr_eq(a, b)));

    let reads = ctx.backend().query_count();
    let alice = ctx.get::<Person>(1).unwrap();
    assert!(Rc::ptr_eq(&alice, &all[0]));
    assert_eq!(ctx.backend().query_count(), reads);
}

#[test]
fn query_one_and_first() {
    let mut ctx = context(seeded_backend());
    let bruno = ctx
        .query_one(&Query::<Person>::new().filter(Condition::col("name").eq("bruno")))
        .unwrap();
    assert_eq!(bruno.borrow().age, Some(17));

    let err = ctx
        .query_one(&Query::<Person>::new().filter(Condition::col("name").eq("zed")))
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(ref e) if e.key.is_none()));

    let err = ctx
        .query_one(&Query::<Person>::new().filter(Condition::col("age").ge(18)))
        .unwrap_err();
    assert!(matches!(err, Error::NonUniqueResult(ref e) if e.count == 2));

    let youngest = ctx
        .query_first(&Query::<Person>::new().order_by(OrderBy::asc("age")))
        .unwrap()
        .unwrap();
    assert!(Rc::ptr_eq(&youngest, &bruno));

    let none = ctx
        .query_first(&Query::<Person>::new().filter(Condition::col("age").gt(100)))
        .unwrap();
    assert!(none.is_none());
}

#[test]
fn count_flushes_pending_writes_first() {
    let mut ctx = context(seeded_backend());
    ctx.persist(Person::aged("dora", 52)).unwrap();

    let adults = ctx
        .count(&Query::<Person>::new().filter(Condition::col("age").ge(18)))
        .unwrap();
    assert_eq!(adults, 3);

    let kinds: Vec<StatementKind> = ctx.backend().statements().iter().map(Statement::kind).collect();
    assert_eq!(kinds, [StatementKind::Insert, StatementKind::Select]);
    assert_eq!(ctx.pending_count(), 0);
}

#[test]
fn queries_see_flushed_modifications() {
    let mut ctx = context(seeded_backend());
    let alice = ctx.get::<Person>(1).unwrap();
    alice.borrow_mut().name = "alicia".into();

    let found = ctx
        .query_one(&Query::<Person>::new().filter(Condition::col("name").eq("alicia")))
        .unwrap();
    assert!(Rc::ptr_eq(&found, &alice));
    assert_eq!(ctx.backend().count_of(StatementKind::Update), 1);
}

#[test]
fn commit_mode_defers_writes_past_queries() {
    let mut ctx = commit_mode();
    ctx.persist(Person::aged("dora", 52)).unwrap();
    assert_eq!(ctx.count(&Query::<Person>::new()).unwrap(), 3);
    assert_eq!(ctx.pending_count(), 1);
    assert_eq!(ctx.backend().mutation_count(), 0);

    ctx.commit().unwrap();
    assert_eq!(ctx.backend().row_count("person"), 4);
}

#[test]
fn tracked_instance_wins_over_fresh_row() {
    let mut ctx = commit_mode();
    let alice = ctx.get::<Person>(1).unwrap();
    alice.borrow_mut().name = "alicia".into();

    // The stored row still says "alice"; the unflushed change is kept.
    let found = ctx
        .query_one(&Query::<Person>::new().filter(Condition::col("name").eq("alice")))
        .unwrap();
    assert!(Rc::ptr_eq(&found, &alice));
    assert_eq!(found.borrow().name, "alicia");
}

#[test]
fn removed_entities_are_left_out_of_results() {
    let mut ctx = commit_mode();
    let bruno = ctx.get::<Person>(2).unwrap();
    ctx.remove(&bruno).unwrap();

    let everyone = ctx.query_list(&Query::<Person>::new()).unwrap();
    assert_eq!(names(&everyone), ["alice", "carla"]);
}

#[test]
fn first_result_skips_pending_removals() {
    let mut ctx = commit_mode();
    let alice = ctx.get::<Person>(1).unwrap();
    let bruno = ctx.get::<Person>(2).unwrap();
    ctx.remove(&alice).unwrap();

    let by_id = Query::<Person>::new().order_by(OrderBy::asc("id"));
    let first = ctx.query_first(&by_id).unwrap().unwrap();
    assert!(Rc::ptr_eq(&first, &bruno));

    ctx.remove(&bruno).unwrap();
    let first = ctx.query_first(&by_id).unwrap().unwrap();
    assert_eq!(first.borrow().name, "carla");

    // An explicit limit still caps what the backend returns.
    assert!(ctx.query_first(&by_id.clone().limit(1)).unwrap().is_none());
}

#[test]
fn unknown_column_is_a_backend_error() {
    let mut ctx = context(seeded_backend());
    let err = ctx
        .query_list(&Query::<Person>::new().filter(Condition::col("shoe_size").eq(9)))
        .unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert!(err.sql().is_some_and(|sql| sql.contains("shoe_size")));
}
