#![cfg(feature = "inmem-store")]

use crit::auth::Role;
use crit::models::{
    NewCategory, NewComment, NewGenre, NewReview, NewTitle, NewUser, PageParams, TitleFilter,
    UpdateUser,
};
use crit::repo::{inmem::InMemRepo, RepoError};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use crit::repo::{CategoryRepo, CommentRepo, GenreRepo, ReviewRepo, TitleRepo, UserRepo};

/// Helper that returns a fresh, empty repository for every test run.
fn repo() -> InMemRepo {
    // isolate state: do **not** persist to the default file path
    std::env::set_var("CRIT_DATA_DIR", tempfile::tempdir().unwrap().path());
    InMemRepo::new()
}

fn new_user(username: &str) -> NewUser {
    NewUser {
        username: username.into(),
        email: format!("{username}@example.com"),
        ..NewUser::default()
    }
}

#[tokio::test]
#[serial_test::serial]
async fn user_pair_lookup_and_conflicts() {
    let r = repo();

    let u = r.create_user(new_user("alice")).await.unwrap();
    assert_eq!(u.role, Role::User);
    assert!(!u.is_admin());

    // exact pair found, partial pairs are not
    assert!(r
        .find_user_pair("alice", "alice@example.com")
        .await
        .unwrap()
        .is_some());
    assert!(r
        .find_user_pair("alice", "other@example.com")
        .await
        .unwrap()
        .is_none());
    assert!(r.username_taken("alice").await.unwrap());
    assert!(r.email_taken("alice@example.com").await.unwrap());

    // either unique field colliding is a conflict
    let err = r.create_user(new_user("alice")).await.unwrap_err();
    assert!(matches!(err, RepoError::Conflict));
    let err = r
        .create_user(NewUser {
            username: "alice2".into(),
            email: "alice@example.com".into(),
            ..NewUser::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Conflict));
}

#[tokio::test]
#[serial_test::serial]
async fn confirmation_code_round_trip() {
    let r = repo();
    r.create_user(new_user("bob")).await.unwrap();

    r.set_confirmation_code("bob", "c0de").await.unwrap();
    let u = r.get_user("bob").await.unwrap();
    assert_eq!(u.confirmation_code.as_deref(), Some("c0de"));

    // overwritten on the next issue
    r.set_confirmation_code("bob", "fresh").await.unwrap();
    let u = r.get_user("bob").await.unwrap();
    assert_eq!(u.confirmation_code.as_deref(), Some("fresh"));

    let err = r.set_confirmation_code("ghost", "x").await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound));
}

#[tokio::test]
#[serial_test::serial]
async fn role_update_only_when_supplied() {
    let r = repo();
    r.create_user(new_user("carol")).await.unwrap();

    // a patch without role leaves it alone
    let u = r
        .update_user("carol", UpdateUser { bio: Some("hi".into()), ..UpdateUser::default() })
        .await
        .unwrap();
    assert_eq!(u.role, Role::User);
    assert_eq!(u.bio, "hi");

    let u = r
        .update_user("carol", UpdateUser { role: Some(Role::Moderator), ..UpdateUser::default() })
        .await
        .unwrap();
    assert!(u.is_moderator());
}

#[tokio::test]
#[serial_test::serial]
async fn review_uniqueness_is_enforced_at_the_store() {
    let r = repo();
    let title = r
        .create_title(NewTitle {
            name: "Picnic".into(),
            year: 1972,
            description: None,
            category: None,
            genre: vec![],
        })
        .await
        .unwrap();

    r.create_review(title.id, "alice", NewReview { text: "t".into(), score: 8 })
        .await
        .unwrap();
    // even without the route-level pre-check the second insert loses
    let err = r
        .create_review(title.id, "alice", NewReview { text: "t2".into(), score: 9 })
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Conflict));

    // a different author is fine
    r.create_review(title.id, "bob", NewReview { text: "t".into(), score: 4 })
        .await
        .unwrap();
    let page = r.list_reviews(title.id, PageParams::default()).await.unwrap();
    assert_eq!(page.count, 2);
}

#[tokio::test]
#[serial_test::serial]
async fn cascades_and_set_null() {
    let r = repo();
    r.create_category(NewCategory { name: "Books".into(), slug: "books".into() })
        .await
        .unwrap();
    r.create_genre(NewGenre { name: "SF".into(), slug: "sf".into() })
        .await
        .unwrap();
    let title = r
        .create_title(NewTitle {
            name: "Solaris".into(),
            year: 1961,
            description: None,
            category: Some("books".into()),
            genre: vec!["sf".into()],
        })
        .await
        .unwrap();
    let review = r
        .create_review(title.id, "alice", NewReview { text: "t".into(), score: 10 })
        .await
        .unwrap();
    let comment = r
        .create_comment(review.id, "bob", NewComment { text: "c".into() })
        .await
        .unwrap();

    // category delete nulls the reference, title survives
    r.delete_category("books").await.unwrap();
    let t = r.get_title(title.id).await.unwrap();
    assert!(t.category.is_none());
    assert_eq!(t.genre.len(), 1);

    // genre delete detaches it from the title
    r.delete_genre("sf").await.unwrap();
    let t = r.get_title(title.id).await.unwrap();
    assert!(t.genre.is_empty());

    // title delete removes the review subtree
    r.delete_title(title.id).await.unwrap();
    assert!(matches!(
        r.get_review(title.id, review.id).await.unwrap_err(),
        RepoError::NotFound
    ));
    assert!(matches!(
        r.get_comment(review.id, comment.id).await.unwrap_err(),
        RepoError::NotFound
    ));
}

#[tokio::test]
#[serial_test::serial]
async fn rating_is_the_mean_of_scores() {
    let r = repo();
    let title = r
        .create_title(NewTitle {
            name: "Ubik".into(),
            year: 1969,
            description: None,
            category: None,
            genre: vec![],
        })
        .await
        .unwrap();
    assert!(r.get_title(title.id).await.unwrap().rating.is_none());

    for (author, score) in [("a", 8), ("b", 10), ("c", 6)] {
        r.create_review(title.id, author, NewReview { text: "t".into(), score })
            .await
            .unwrap();
    }
    assert_eq!(r.get_title(title.id).await.unwrap().rating, Some(8.0));

    // an odd mean stays fractional
    r.create_review(title.id, "d", NewReview { text: "t".into(), score: 9 })
        .await
        .unwrap();
    assert_eq!(r.get_title(title.id).await.unwrap().rating, Some(8.25));
}

#[tokio::test]
#[serial_test::serial]
async fn listing_filters_and_slices() {
    let r = repo();
    r.create_category(NewCategory { name: "Films".into(), slug: "films".into() })
        .await
        .unwrap();
    for (name, year, category) in [
        ("Alphaville", 1965, Some("films")),
        ("Chinatown", 1974, Some("films")),
        ("Neuromancer", 1984, None),
    ] {
        r.create_title(NewTitle {
            name: name.into(),
            year,
            description: None,
            category: category.map(str::to_string),
            genre: vec![],
        })
        .await
        .unwrap();
    }

    let page = r
        .list_titles(
            TitleFilter { category: Some("films".into()), ..TitleFilter::default() },
            PageParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.count, 2);

    // slice keeps the full count; ordering is alphabetical
    let page = r
        .list_titles(TitleFilter::default(), PageParams { limit: Some(1), offset: 1 })
        .await
        .unwrap();
    assert_eq!(page.count, 3);
    assert_eq!(page.results.len(), 1);
    assert_eq!(page.results[0].name, "Chinatown");

    // offset past the end yields an empty slice, not a fault
    let page = r
        .list_titles(TitleFilter::default(), PageParams { limit: None, offset: 99 })
        .await
        .unwrap();
    assert_eq!(page.count, 3);
    assert!(page.results.is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn snapshot_survives_reload() {
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("CRIT_DATA_DIR", tmp.path());

    let r = InMemRepo::new();
    r.create_user(new_user("dana")).await.unwrap();
    r.set_confirmation_code("dana", "persisted").await.unwrap();

    // a second instance over the same data dir sees the state
    let r2 = InMemRepo::new();
    let u = r2.get_user("dana").await.unwrap();
    assert_eq!(u.confirmation_code.as_deref(), Some("persisted"));
}
