use async_trait::async_trait;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("storage error: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn list_users(&self, search: Option<&str>, page: PageParams) -> RepoResult<Page<User>>;
    async fn get_user(&self, username: &str) -> RepoResult<User>;
    /// Lookup by the exact (username, email) pair; drives sign-up idempotency.
    async fn find_user_pair(&self, username: &str, email: &str) -> RepoResult<Option<User>>;
    async fn username_taken(&self, username: &str) -> RepoResult<bool>;
    async fn email_taken(&self, email: &str) -> RepoResult<bool>;
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn update_user(&self, username: &str, upd: UpdateUser) -> RepoResult<User>;
    async fn set_confirmation_code(&self, username: &str, code: &str) -> RepoResult<()>;
    /// Removes the user and, transitively, their reviews and comments.
    async fn delete_user(&self, username: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait CategoryRepo: Send + Sync {
    async fn list_categories(&self, search: Option<&str>, page: PageParams) -> RepoResult<Page<Category>>;
    async fn create_category(&self, new: NewCategory) -> RepoResult<Category>;
    async fn category_exists(&self, slug: &str) -> RepoResult<bool>;
    /// Titles referencing the category keep existing with category = null.
    async fn delete_category(&self, slug: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait GenreRepo: Send + Sync {
    async fn list_genres(&self, search: Option<&str>, page: PageParams) -> RepoResult<Page<Genre>>;
    async fn create_genre(&self, new: NewGenre) -> RepoResult<Genre>;
    async fn genre_exists(&self, slug: &str) -> RepoResult<bool>;
    async fn delete_genre(&self, slug: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait TitleRepo: Send + Sync {
    async fn list_titles(&self, filter: TitleFilter, page: PageParams) -> RepoResult<Page<Title>>;
    async fn create_title(&self, new: NewTitle) -> RepoResult<Title>;
    async fn get_title(&self, id: Id) -> RepoResult<Title>;
    async fn update_title(&self, id: Id, upd: UpdateTitle) -> RepoResult<Title>;
    /// Cascades: the title's reviews and their comments go with it.
    async fn delete_title(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait ReviewRepo: Send + Sync {
    async fn list_reviews(&self, title_id: Id, page: PageParams) -> RepoResult<Page<Review>>;
    async fn find_review(&self, title_id: Id, author: &str) -> RepoResult<Option<Review>>;
    /// The (title, author) uniqueness constraint is enforced here at commit
    /// time; callers may pre-check with `find_review` for a friendlier error.
    async fn create_review(&self, title_id: Id, author: &str, new: NewReview) -> RepoResult<Review>;
    async fn get_review(&self, title_id: Id, id: Id) -> RepoResult<Review>;
    async fn update_review(&self, title_id: Id, id: Id, upd: UpdateReview) -> RepoResult<Review>;
    async fn delete_review(&self, title_id: Id, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn list_comments(&self, review_id: Id, page: PageParams) -> RepoResult<Page<Comment>>;
    async fn create_comment(&self, review_id: Id, author: &str, new: NewComment) -> RepoResult<Comment>;
    async fn get_comment(&self, review_id: Id, id: Id) -> RepoResult<Comment>;
    async fn update_comment(&self, review_id: Id, id: Id, upd: UpdateComment) -> RepoResult<Comment>;
    async fn delete_comment(&self, review_id: Id, id: Id) -> RepoResult<()>;
}

pub trait Repo:
    UserRepo + CategoryRepo + GenreRepo + TitleRepo + ReviewRepo + CommentRepo
{
}

impl<T> Repo for T where
    T: UserRepo + CategoryRepo + GenreRepo + TitleRepo + ReviewRepo + CommentRepo
{
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/state.json";

    fn paginate<T>(items: Vec<T>, page: &PageParams) -> Page<T> {
        let count = items.len() as i64;
        let offset = page.offset.clamp(0, count) as usize;
        let mut results: Vec<T> = items.into_iter().skip(offset).collect();
        if let Some(limit) = page.limit {
            results.truncate(limit.max(0) as usize);
        }
        Page { count, results }
    }

    /// Stored form of a title; category and genres are held as slugs and
    /// resolved on read.
    #[derive(Clone, Serialize, Deserialize)]
    struct TitleRec {
        id: Id,
        name: String,
        year: i32,
        description: Option<String>,
        category: Option<String>,
        genres: Vec<String>,
    }

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<String, User>,        // by username
        categories: HashMap<String, Category>, // by slug
        genres: HashMap<String, Genre>,       // by slug
        titles: HashMap<Id, TitleRec>,
        reviews: HashMap<Id, Review>,
        comments: HashMap<Id, Comment>,
        next_id: Id,
    }

    impl State {
        fn materialize(&self, rec: &TitleRec) -> Title {
            let scores: Vec<i32> = self
                .reviews
                .values()
                .filter(|r| r.title_id == rec.id)
                .map(|r| r.score)
                .collect();
            let rating = if scores.is_empty() {
                None
            } else {
                Some(scores.iter().map(|s| f64::from(*s)).sum::<f64>() / scores.len() as f64)
            };
            let mut genre: Vec<Genre> = rec
                .genres
                .iter()
                .filter_map(|slug| self.genres.get(slug).cloned())
                .collect();
            genre.sort_by(|a, b| a.name.cmp(&b.name));
            Title {
                id: rec.id,
                name: rec.name.clone(),
                year: rec.year,
                rating,
                description: rec.description.clone(),
                category: rec.category.as_ref().and_then(|s| self.categories.get(s).cloned()),
                genre,
            }
        }

        /// Deletes the given reviews together with their comments.
        fn drop_reviews(&mut self, review_ids: &[Id]) {
            for id in review_ids {
                self.reviews.remove(id);
            }
            self.comments
                .retain(|_, c| !review_ids.contains(&c.review_id));
        }
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("CRIT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("CRIT_DATA_DIR").is_ok() {
                let mut p = Self::data_dir();
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        log::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        log::warn!(
                            "failed to parse snapshot '{}': {e}; starting empty",
                            path.display()
                        );
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    log::error!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn list_users(&self, search: Option<&str>, page: PageParams) -> RepoResult<Page<User>> {
            let s = self.state.read().unwrap();
            let needle = search.map(str::to_lowercase);
            let mut users: Vec<User> = s
                .users
                .values()
                .filter(|u| match &needle {
                    Some(n) => u.username.to_lowercase().contains(n),
                    None => true,
                })
                .cloned()
                .collect();
            users.sort_by(|a, b| a.username.cmp(&b.username));
            Ok(paginate(users, &page))
        }

        async fn get_user(&self, username: &str) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users.get(username).cloned().ok_or(RepoError::NotFound)
        }

        async fn find_user_pair(&self, username: &str, email: &str) -> RepoResult<Option<User>> {
            let s = self.state.read().unwrap();
            Ok(s.users
                .get(username)
                .filter(|u| u.email == email)
                .cloned())
        }

        async fn username_taken(&self, username: &str) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.users.contains_key(username))
        }

        async fn email_taken(&self, email: &str) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.users.values().any(|u| u.email == email))
        }

        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            if s.users.contains_key(&new.username) || s.users.values().any(|u| u.email == new.email)
            {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let user = User {
                id,
                username: new.username.clone(),
                email: new.email,
                first_name: new.first_name,
                last_name: new.last_name,
                bio: new.bio,
                role: new.role,
                is_staff: false,
                is_superuser: false,
                confirmation_code: None,
            };
            s.users.insert(new.username, user.clone());
            drop(s);
            self.persist();
            Ok(user)
        }

        async fn update_user(&self, username: &str, upd: UpdateUser) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();

            // email uniqueness check before the mutable borrow
            if let Some(ref email) = upd.email {
                if s.users
                    .values()
                    .any(|u| u.email == *email && u.username != username)
                {
                    return Err(RepoError::Conflict);
                }
            }

            let user = s.users.get_mut(username).ok_or(RepoError::NotFound)?;
            if let Some(email) = upd.email {
                user.email = email;
            }
            if let Some(first_name) = upd.first_name {
                user.first_name = first_name;
            }
            if let Some(last_name) = upd.last_name {
                user.last_name = last_name;
            }
            if let Some(bio) = upd.bio {
                user.bio = bio;
            }
            if let Some(role) = upd.role {
                user.role = role;
            }
            let updated = user.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn set_confirmation_code(&self, username: &str, code: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let user = s.users.get_mut(username).ok_or(RepoError::NotFound)?;
            user.confirmation_code = Some(code.to_string());
            drop(s);
            self.persist();
            Ok(())
        }

        async fn delete_user(&self, username: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.users.remove(username).ok_or(RepoError::NotFound)?;
            let review_ids: Vec<Id> = s
                .reviews
                .values()
                .filter(|r| r.author == username)
                .map(|r| r.id)
                .collect();
            s.drop_reviews(&review_ids);
            s.comments.retain(|_, c| c.author != username);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl CategoryRepo for InMemRepo {
        async fn list_categories(
            &self,
            search: Option<&str>,
            page: PageParams,
        ) -> RepoResult<Page<Category>> {
            let s = self.state.read().unwrap();
            let needle = search.map(str::to_lowercase);
            let mut categories: Vec<Category> = s
                .categories
                .values()
                .filter(|c| match &needle {
                    Some(n) => c.name.to_lowercase().contains(n),
                    None => true,
                })
                .cloned()
                .collect();
            categories.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(paginate(categories, &page))
        }

        async fn create_category(&self, new: NewCategory) -> RepoResult<Category> {
            let mut s = self.state.write().unwrap();
            if s.categories.contains_key(&new.slug) {
                return Err(RepoError::Conflict);
            }
            let category = Category { name: new.name, slug: new.slug.clone() };
            s.categories.insert(new.slug, category.clone());
            drop(s);
            self.persist();
            Ok(category)
        }

        async fn category_exists(&self, slug: &str) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.categories.contains_key(slug))
        }

        async fn delete_category(&self, slug: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.categories.remove(slug).ok_or(RepoError::NotFound)?;
            for title in s.titles.values_mut() {
                if title.category.as_deref() == Some(slug) {
                    title.category = None;
                }
            }
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl GenreRepo for InMemRepo {
        async fn list_genres(&self, search: Option<&str>, page: PageParams) -> RepoResult<Page<Genre>> {
            let s = self.state.read().unwrap();
            let needle = search.map(str::to_lowercase);
            let mut genres: Vec<Genre> = s
                .genres
                .values()
                .filter(|g| match &needle {
                    Some(n) => g.name.to_lowercase().contains(n),
                    None => true,
                })
                .cloned()
                .collect();
            genres.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(paginate(genres, &page))
        }

        async fn create_genre(&self, new: NewGenre) -> RepoResult<Genre> {
            let mut s = self.state.write().unwrap();
            if s.genres.contains_key(&new.slug) {
                return Err(RepoError::Conflict);
            }
            let genre = Genre { name: new.name, slug: new.slug.clone() };
            s.genres.insert(new.slug, genre.clone());
            drop(s);
            self.persist();
            Ok(genre)
        }

        async fn genre_exists(&self, slug: &str) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.genres.contains_key(slug))
        }

        async fn delete_genre(&self, slug: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.genres.remove(slug).ok_or(RepoError::NotFound)?;
            for title in s.titles.values_mut() {
                title.genres.retain(|g| g != slug);
            }
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl TitleRepo for InMemRepo {
        async fn list_titles(&self, filter: TitleFilter, page: PageParams) -> RepoResult<Page<Title>> {
            let s = self.state.read().unwrap();
            let needle = filter.name.as_deref().map(str::to_lowercase);
            let mut titles: Vec<Title> = s
                .titles
                .values()
                .filter(|t| match filter.category.as_deref() {
                    Some(slug) => t.category.as_deref() == Some(slug),
                    None => true,
                })
                .filter(|t| match filter.genre.as_deref() {
                    Some(slug) => t.genres.iter().any(|g| g == slug),
                    None => true,
                })
                .filter(|t| match &needle {
                    Some(n) => t.name.to_lowercase().contains(n),
                    None => true,
                })
                .filter(|t| match filter.year {
                    Some(year) => t.year == year,
                    None => true,
                })
                .map(|rec| s.materialize(rec))
                .collect();
            titles.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(paginate(titles, &page))
        }

        async fn create_title(&self, new: NewTitle) -> RepoResult<Title> {
            let mut s = self.state.write().unwrap();
            if let Some(ref slug) = new.category {
                if !s.categories.contains_key(slug) {
                    return Err(RepoError::NotFound);
                }
            }
            for slug in &new.genre {
                if !s.genres.contains_key(slug) {
                    return Err(RepoError::NotFound);
                }
            }
            let id = Self::next_id(&mut s);
            let rec = TitleRec {
                id,
                name: new.name,
                year: new.year,
                description: new.description,
                category: new.category,
                genres: new.genre,
            };
            s.titles.insert(id, rec.clone());
            let title = s.materialize(&rec);
            drop(s);
            self.persist();
            Ok(title)
        }

        async fn get_title(&self, id: Id) -> RepoResult<Title> {
            let s = self.state.read().unwrap();
            s.titles
                .get(&id)
                .map(|rec| s.materialize(rec))
                .ok_or(RepoError::NotFound)
        }

        async fn update_title(&self, id: Id, upd: UpdateTitle) -> RepoResult<Title> {
            let mut s = self.state.write().unwrap();

            // referential checks before the mutable borrow
            if let Some(ref slug) = upd.category {
                if !s.categories.contains_key(slug) {
                    return Err(RepoError::NotFound);
                }
            }
            if let Some(ref genres) = upd.genre {
                for slug in genres {
                    if !s.genres.contains_key(slug) {
                        return Err(RepoError::NotFound);
                    }
                }
            }

            let rec = s.titles.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(name) = upd.name {
                rec.name = name;
            }
            if let Some(year) = upd.year {
                rec.year = year;
            }
            if let Some(description) = upd.description {
                rec.description = Some(description);
            }
            if let Some(category) = upd.category {
                rec.category = Some(category);
            }
            if let Some(genres) = upd.genre {
                rec.genres = genres;
            }
            let rec = rec.clone();
            let title = s.materialize(&rec);
            drop(s);
            self.persist();
            Ok(title)
        }

        async fn delete_title(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.titles.remove(&id).ok_or(RepoError::NotFound)?;
            let review_ids: Vec<Id> = s
                .reviews
                .values()
                .filter(|r| r.title_id == id)
                .map(|r| r.id)
                .collect();
            s.drop_reviews(&review_ids);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl ReviewRepo for InMemRepo {
        async fn list_reviews(&self, title_id: Id, page: PageParams) -> RepoResult<Page<Review>> {
            let s = self.state.read().unwrap();
            let mut reviews: Vec<Review> = s
                .reviews
                .values()
                .filter(|r| r.title_id == title_id)
                .cloned()
                .collect();
            reviews.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(b.id.cmp(&a.id)));
            Ok(paginate(reviews, &page))
        }

        async fn find_review(&self, title_id: Id, author: &str) -> RepoResult<Option<Review>> {
            let s = self.state.read().unwrap();
            Ok(s.reviews
                .values()
                .find(|r| r.title_id == title_id && r.author == author)
                .cloned())
        }

        async fn create_review(
            &self,
            title_id: Id,
            author: &str,
            new: NewReview,
        ) -> RepoResult<Review> {
            let mut s = self.state.write().unwrap();
            if !s.titles.contains_key(&title_id) {
                return Err(RepoError::NotFound);
            }
            // uniqueness re-checked under the write lock; the route's earlier
            // probe is only a fast path
            if s.reviews
                .values()
                .any(|r| r.title_id == title_id && r.author == author)
            {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let review = Review {
                id,
                title_id,
                author: author.to_string(),
                text: new.text,
                score: new.score,
                pub_date: Utc::now(),
            };
            s.reviews.insert(id, review.clone());
            drop(s);
            self.persist();
            Ok(review)
        }

        async fn get_review(&self, title_id: Id, id: Id) -> RepoResult<Review> {
            let s = self.state.read().unwrap();
            s.reviews
                .get(&id)
                .filter(|r| r.title_id == title_id)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn update_review(&self, title_id: Id, id: Id, upd: UpdateReview) -> RepoResult<Review> {
            let mut s = self.state.write().unwrap();
            let review = s
                .reviews
                .get_mut(&id)
                .filter(|r| r.title_id == title_id)
                .ok_or(RepoError::NotFound)?;
            if let Some(text) = upd.text {
                review.text = text;
            }
            if let Some(score) = upd.score {
                review.score = score;
            }
            let updated = review.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_review(&self, title_id: Id, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if !s
                .reviews
                .get(&id)
                .map(|r| r.title_id == title_id)
                .unwrap_or(false)
            {
                return Err(RepoError::NotFound);
            }
            s.drop_reviews(&[id]);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl CommentRepo for InMemRepo {
        async fn list_comments(&self, review_id: Id, page: PageParams) -> RepoResult<Page<Comment>> {
            let s = self.state.read().unwrap();
            let mut comments: Vec<Comment> = s
                .comments
                .values()
                .filter(|c| c.review_id == review_id)
                .cloned()
                .collect();
            comments.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(b.id.cmp(&a.id)));
            Ok(paginate(comments, &page))
        }

        async fn create_comment(
            &self,
            review_id: Id,
            author: &str,
            new: NewComment,
        ) -> RepoResult<Comment> {
            let mut s = self.state.write().unwrap();
            if !s.reviews.contains_key(&review_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let comment = Comment {
                id,
                review_id,
                author: author.to_string(),
                text: new.text,
                pub_date: Utc::now(),
            };
            s.comments.insert(id, comment.clone());
            drop(s);
            self.persist();
            Ok(comment)
        }

        async fn get_comment(&self, review_id: Id, id: Id) -> RepoResult<Comment> {
            let s = self.state.read().unwrap();
            s.comments
                .get(&id)
                .filter(|c| c.review_id == review_id)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn update_comment(
            &self,
            review_id: Id,
            id: Id,
            upd: UpdateComment,
        ) -> RepoResult<Comment> {
            let mut s = self.state.write().unwrap();
            let comment = s
                .comments
                .get_mut(&id)
                .filter(|c| c.review_id == review_id)
                .ok_or(RepoError::NotFound)?;
            if let Some(text) = upd.text {
                comment.text = text;
            }
            let updated = comment.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_comment(&self, review_id: Id, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if !s
                .comments
                .get(&id)
                .map(|c| c.review_id == review_id)
                .unwrap_or(false)
            {
                return Err(RepoError::NotFound);
            }
            s.comments.remove(&id);
            drop(s);
            self.persist();
            Ok(())
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use crate::auth::Role;
    use sqlx::{Pool, Postgres};

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }
    }

    fn map_sqlx(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            // unique_violation
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                RepoError::Conflict
            }
            // foreign_key_violation: the referenced row raced away
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => {
                RepoError::NotFound
            }
            other => RepoError::Internal(other.to_string()),
        }
    }

    const USER_COLS: &str = "id, username, email, first_name, last_name, bio, role, is_staff, is_superuser, confirmation_code";

    #[derive(sqlx::FromRow)]
    struct UserRow {
        id: Id,
        username: String,
        email: String,
        first_name: String,
        last_name: String,
        bio: String,
        role: String,
        is_staff: bool,
        is_superuser: bool,
        confirmation_code: Option<String>,
    }

    impl From<UserRow> for User {
        fn from(r: UserRow) -> Self {
            User {
                id: r.id,
                username: r.username,
                email: r.email,
                first_name: r.first_name,
                last_name: r.last_name,
                bio: r.bio,
                role: r.role.parse().unwrap_or(Role::User),
                is_staff: r.is_staff,
                is_superuser: r.is_superuser,
                confirmation_code: r.confirmation_code,
            }
        }
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn list_users(&self, search: Option<&str>, page: PageParams) -> RepoResult<Page<User>> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM users WHERE ($1::text IS NULL OR username ILIKE '%'||$1||'%')",
            )
            .bind(search)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            let rows: Vec<UserRow> = sqlx::query_as(&format!(
                "SELECT {USER_COLS} FROM users \
                 WHERE ($1::text IS NULL OR username ILIKE '%'||$1||'%') \
                 ORDER BY username LIMIT $2 OFFSET $3"
            ))
            .bind(search)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(Page { count, results: rows.into_iter().map(User::from).collect() })
        }

        async fn get_user(&self, username: &str) -> RepoResult<User> {
            let row: UserRow =
                sqlx::query_as(&format!("SELECT {USER_COLS} FROM users WHERE username = $1"))
                    .bind(username)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_sqlx)?;
            Ok(row.into())
        }

        async fn find_user_pair(&self, username: &str, email: &str) -> RepoResult<Option<User>> {
            let row: Option<UserRow> = sqlx::query_as(&format!(
                "SELECT {USER_COLS} FROM users WHERE username = $1 AND email = $2"
            ))
            .bind(username)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(row.map(User::from))
        }

        async fn username_taken(&self, username: &str) -> RepoResult<bool> {
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
                .bind(username)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)
        }

        async fn email_taken(&self, email: &str) -> RepoResult<bool> {
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
                .bind(email)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)
        }

        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let row: UserRow = sqlx::query_as(&format!(
                "INSERT INTO users (username, email, first_name, last_name, bio, role) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING {USER_COLS}"
            ))
            .bind(&new.username)
            .bind(&new.email)
            .bind(&new.first_name)
            .bind(&new.last_name)
            .bind(&new.bio)
            .bind(new.role.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(row.into())
        }

        async fn update_user(&self, username: &str, upd: UpdateUser) -> RepoResult<User> {
            let row: UserRow = sqlx::query_as(&format!(
                "UPDATE users SET \
                   email = COALESCE($2, email), \
                   first_name = COALESCE($3, first_name), \
                   last_name = COALESCE($4, last_name), \
                   bio = COALESCE($5, bio), \
                   role = COALESCE($6, role) \
                 WHERE username = $1 RETURNING {USER_COLS}"
            ))
            .bind(username)
            .bind(upd.email.as_deref())
            .bind(upd.first_name.as_deref())
            .bind(upd.last_name.as_deref())
            .bind(upd.bio.as_deref())
            .bind(upd.role.map(|r| r.as_str()))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(row.into())
        }

        async fn set_confirmation_code(&self, username: &str, code: &str) -> RepoResult<()> {
            let res = sqlx::query("UPDATE users SET confirmation_code = $2 WHERE username = $1")
                .bind(username)
                .bind(code)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn delete_user(&self, username: &str) -> RepoResult<()> {
            // reviews and comments go via FK cascade
            let res = sqlx::query("DELETE FROM users WHERE username = $1")
                .bind(username)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CategoryRepo for PgRepo {
        async fn list_categories(
            &self,
            search: Option<&str>,
            page: PageParams,
        ) -> RepoResult<Page<Category>> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM categories WHERE ($1::text IS NULL OR name ILIKE '%'||$1||'%')",
            )
            .bind(search)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            let results = sqlx::query_as::<_, Category>(
                "SELECT name, slug FROM categories \
                 WHERE ($1::text IS NULL OR name ILIKE '%'||$1||'%') \
                 ORDER BY name LIMIT $2 OFFSET $3",
            )
            .bind(search)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(Page { count, results })
        }

        async fn create_category(&self, new: NewCategory) -> RepoResult<Category> {
            sqlx::query_as::<_, Category>(
                "INSERT INTO categories (name, slug) VALUES ($1, $2) RETURNING name, slug",
            )
            .bind(&new.name)
            .bind(&new.slug)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
        }

        async fn category_exists(&self, slug: &str) -> RepoResult<bool> {
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM categories WHERE slug = $1)")
                .bind(slug)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)
        }

        async fn delete_category(&self, slug: &str) -> RepoResult<()> {
            // titles fall back to category = NULL via the FK
            let res = sqlx::query("DELETE FROM categories WHERE slug = $1")
                .bind(slug)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl GenreRepo for PgRepo {
        async fn list_genres(&self, search: Option<&str>, page: PageParams) -> RepoResult<Page<Genre>> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM genres WHERE ($1::text IS NULL OR name ILIKE '%'||$1||'%')",
            )
            .bind(search)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            let results = sqlx::query_as::<_, Genre>(
                "SELECT name, slug FROM genres \
                 WHERE ($1::text IS NULL OR name ILIKE '%'||$1||'%') \
                 ORDER BY name LIMIT $2 OFFSET $3",
            )
            .bind(search)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(Page { count, results })
        }

        async fn create_genre(&self, new: NewGenre) -> RepoResult<Genre> {
            sqlx::query_as::<_, Genre>(
                "INSERT INTO genres (name, slug) VALUES ($1, $2) RETURNING name, slug",
            )
            .bind(&new.name)
            .bind(&new.slug)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
        }

        async fn genre_exists(&self, slug: &str) -> RepoResult<bool> {
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM genres WHERE slug = $1)")
                .bind(slug)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)
        }

        async fn delete_genre(&self, slug: &str) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM genres WHERE slug = $1")
                .bind(slug)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[derive(sqlx::FromRow)]
    struct TitleRow {
        id: Id,
        name: String,
        year: i32,
        description: Option<String>,
        category_name: Option<String>,
        category_slug: Option<String>,
        rating: Option<f64>,
    }

    const TITLE_SELECT: &str = "SELECT t.id, t.name, t.year, t.description, \
        c.name AS category_name, c.slug AS category_slug, \
        (SELECT AVG(r.score)::float8 FROM reviews r WHERE r.title_id = t.id) AS rating \
        FROM titles t LEFT JOIN categories c ON c.id = t.category_id";

    const TITLE_FILTER: &str = "($1::text IS NULL OR c.slug = $1) \
        AND ($2::text IS NULL OR EXISTS (SELECT 1 FROM title_genres tg \
             JOIN genres g ON g.id = tg.genre_id WHERE tg.title_id = t.id AND g.slug = $2)) \
        AND ($3::text IS NULL OR t.name ILIKE '%'||$3||'%') \
        AND ($4::int4 IS NULL OR t.year = $4)";

    impl PgRepo {
        async fn genres_of(&self, title_id: Id) -> RepoResult<Vec<Genre>> {
            sqlx::query_as::<_, Genre>(
                "SELECT g.name, g.slug FROM genres g \
                 JOIN title_genres tg ON tg.genre_id = g.id \
                 WHERE tg.title_id = $1 ORDER BY g.name",
            )
            .bind(title_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
        }

        async fn title_from_row(&self, row: TitleRow) -> RepoResult<Title> {
            let genre = self.genres_of(row.id).await?;
            let category = match (row.category_name, row.category_slug) {
                (Some(name), Some(slug)) => Some(Category { name, slug }),
                _ => None,
            };
            Ok(Title {
                id: row.id,
                name: row.name,
                year: row.year,
                rating: row.rating,
                description: row.description,
                category,
                genre,
            })
        }
    }

    #[async_trait]
    impl TitleRepo for PgRepo {
        async fn list_titles(&self, filter: TitleFilter, page: PageParams) -> RepoResult<Page<Title>> {
            let count: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM titles t \
                 LEFT JOIN categories c ON c.id = t.category_id WHERE {TITLE_FILTER}"
            ))
            .bind(filter.category.as_deref())
            .bind(filter.genre.as_deref())
            .bind(filter.name.as_deref())
            .bind(filter.year)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            let rows: Vec<TitleRow> = sqlx::query_as(&format!(
                "{TITLE_SELECT} WHERE {TITLE_FILTER} ORDER BY t.name LIMIT $5 OFFSET $6"
            ))
            .bind(filter.category.as_deref())
            .bind(filter.genre.as_deref())
            .bind(filter.name.as_deref())
            .bind(filter.year)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            let mut results = Vec::with_capacity(rows.len());
            for row in rows {
                results.push(self.title_from_row(row).await?);
            }
            Ok(Page { count, results })
        }

        async fn create_title(&self, new: NewTitle) -> RepoResult<Title> {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
            let category_id: Option<Id> = match &new.category {
                Some(slug) => Some(
                    sqlx::query_scalar("SELECT id FROM categories WHERE slug = $1")
                        .bind(slug)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(map_sqlx)?
                        .ok_or(RepoError::NotFound)?,
                ),
                None => None,
            };
            let id: Id = sqlx::query_scalar(
                "INSERT INTO titles (name, year, description, category_id) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
            )
            .bind(&new.name)
            .bind(new.year)
            .bind(new.description.as_deref())
            .bind(category_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            for slug in &new.genre {
                let res = sqlx::query(
                    "INSERT INTO title_genres (title_id, genre_id) \
                     SELECT $1, id FROM genres WHERE slug = $2",
                )
                .bind(id)
                .bind(slug)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                if res.rows_affected() == 0 {
                    return Err(RepoError::NotFound);
                }
            }
            tx.commit().await.map_err(map_sqlx)?;
            self.get_title(id).await
        }

        async fn get_title(&self, id: Id) -> RepoResult<Title> {
            let row: TitleRow = sqlx::query_as(&format!("{TITLE_SELECT} WHERE t.id = $1"))
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
            self.title_from_row(row).await
        }

        async fn update_title(&self, id: Id, upd: UpdateTitle) -> RepoResult<Title> {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
            let res = sqlx::query(
                "UPDATE titles SET \
                   name = COALESCE($2, name), \
                   year = COALESCE($3, year), \
                   description = COALESCE($4, description) \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(upd.name.as_deref())
            .bind(upd.year)
            .bind(upd.description.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            if let Some(slug) = &upd.category {
                let category_id: Id = sqlx::query_scalar("SELECT id FROM categories WHERE slug = $1")
                    .bind(slug)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_sqlx)?
                    .ok_or(RepoError::NotFound)?;
                sqlx::query("UPDATE titles SET category_id = $2 WHERE id = $1")
                    .bind(id)
                    .bind(category_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
            }
            if let Some(genres) = &upd.genre {
                sqlx::query("DELETE FROM title_genres WHERE title_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                for slug in genres {
                    let res = sqlx::query(
                        "INSERT INTO title_genres (title_id, genre_id) \
                         SELECT $1, id FROM genres WHERE slug = $2",
                    )
                    .bind(id)
                    .bind(slug)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                    if res.rows_affected() == 0 {
                        return Err(RepoError::NotFound);
                    }
                }
            }
            tx.commit().await.map_err(map_sqlx)?;
            self.get_title(id).await
        }

        async fn delete_title(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM titles WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    const REVIEW_SELECT: &str = "SELECT r.id, r.title_id, u.username AS author, \
        r.text, r.score, r.pub_date \
        FROM reviews r JOIN users u ON u.id = r.author_id";

    #[async_trait]
    impl ReviewRepo for PgRepo {
        async fn list_reviews(&self, title_id: Id, page: PageParams) -> RepoResult<Page<Review>> {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM reviews WHERE title_id = $1")
                    .bind(title_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_sqlx)?;
            let results = sqlx::query_as::<_, Review>(&format!(
                "{REVIEW_SELECT} WHERE r.title_id = $1 \
                 ORDER BY r.pub_date DESC, r.id DESC LIMIT $2 OFFSET $3"
            ))
            .bind(title_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(Page { count, results })
        }

        async fn find_review(&self, title_id: Id, author: &str) -> RepoResult<Option<Review>> {
            sqlx::query_as::<_, Review>(&format!(
                "{REVIEW_SELECT} WHERE r.title_id = $1 AND u.username = $2"
            ))
            .bind(title_id)
            .bind(author)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
        }

        async fn create_review(
            &self,
            title_id: Id,
            author: &str,
            new: NewReview,
        ) -> RepoResult<Review> {
            let author_id: Id = sqlx::query_scalar("SELECT id FROM users WHERE username = $1")
                .bind(author)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?
                .ok_or(RepoError::NotFound)?;
            // UNIQUE (title_id, author_id) turns the duplicate race into Conflict
            let id: Id = sqlx::query_scalar(
                "INSERT INTO reviews (title_id, author_id, text, score) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
            )
            .bind(title_id)
            .bind(author_id)
            .bind(&new.text)
            .bind(new.score)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            self.get_review(title_id, id).await
        }

        async fn get_review(&self, title_id: Id, id: Id) -> RepoResult<Review> {
            sqlx::query_as::<_, Review>(&format!(
                "{REVIEW_SELECT} WHERE r.title_id = $1 AND r.id = $2"
            ))
            .bind(title_id)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
        }

        async fn update_review(&self, title_id: Id, id: Id, upd: UpdateReview) -> RepoResult<Review> {
            let res = sqlx::query(
                "UPDATE reviews SET \
                   text = COALESCE($3, text), \
                   score = COALESCE($4, score) \
                 WHERE title_id = $1 AND id = $2",
            )
            .bind(title_id)
            .bind(id)
            .bind(upd.text.as_deref())
            .bind(upd.score)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            self.get_review(title_id, id).await
        }

        async fn delete_review(&self, title_id: Id, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM reviews WHERE title_id = $1 AND id = $2")
                .bind(title_id)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    const COMMENT_SELECT: &str = "SELECT cm.id, cm.review_id, u.username AS author, \
        cm.text, cm.pub_date \
        FROM comments cm JOIN users u ON u.id = cm.author_id";

    #[async_trait]
    impl CommentRepo for PgRepo {
        async fn list_comments(&self, review_id: Id, page: PageParams) -> RepoResult<Page<Comment>> {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM comments WHERE review_id = $1")
                    .bind(review_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_sqlx)?;
            let results = sqlx::query_as::<_, Comment>(&format!(
                "{COMMENT_SELECT} WHERE cm.review_id = $1 \
                 ORDER BY cm.pub_date DESC, cm.id DESC LIMIT $2 OFFSET $3"
            ))
            .bind(review_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            Ok(Page { count, results })
        }

        async fn create_comment(
            &self,
            review_id: Id,
            author: &str,
            new: NewComment,
        ) -> RepoResult<Comment> {
            let author_id: Id = sqlx::query_scalar("SELECT id FROM users WHERE username = $1")
                .bind(author)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?
                .ok_or(RepoError::NotFound)?;
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM reviews WHERE id = $1)")
                    .bind(review_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_sqlx)?;
            if !exists {
                return Err(RepoError::NotFound);
            }
            let id: Id = sqlx::query_scalar(
                "INSERT INTO comments (review_id, author_id, text) \
                 VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(review_id)
            .bind(author_id)
            .bind(&new.text)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            self.get_comment(review_id, id).await
        }

        async fn get_comment(&self, review_id: Id, id: Id) -> RepoResult<Comment> {
            sqlx::query_as::<_, Comment>(&format!(
                "{COMMENT_SELECT} WHERE cm.review_id = $1 AND cm.id = $2"
            ))
            .bind(review_id)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
        }

        async fn update_comment(
            &self,
            review_id: Id,
            id: Id,
            upd: UpdateComment,
        ) -> RepoResult<Comment> {
            let res = sqlx::query(
                "UPDATE comments SET text = COALESCE($3, text) \
                 WHERE review_id = $1 AND id = $2",
            )
            .bind(review_id)
            .bind(id)
            .bind(upd.text.as_deref())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            self.get_comment(review_id, id).await
        }

        async fn delete_comment(&self, review_id: Id, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM comments WHERE review_id = $1 AND id = $2")
                .bind(review_id)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }
}
