use super::{
    config::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE},
    errors::ApiError,
    models::{Author, Comment, Note, NoteView, ObjectId, User},
    store::{DocumentStore, DuplicateKey, Filter, FindOptions, Sort, SortKey},
};
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use validator::Validate;

pub type Result<T> = std::result::Result<T, ApiError>;

/// A unique-key collision is the caller's mistake, not a server fault.
fn write_error<D: Document>(err: anyhow::Error) -> ApiError {
    match err.downcast_ref::<DuplicateKey>() {
        Some(dup) => {
            ApiError::validation(&dup.field, format!("{} already exists", D::KIND))
        }
        None => err.into(),
    }
}

/// A typed entity stored in one collection of the document store. Every
/// write is validated against the entity's schema first, so an invalid
/// document never reaches the store.
#[async_trait]
pub trait Document:
    Serialize + DeserializeOwned + Validate + Send + Sync + Sized
{
    const COLLECTION: &'static str;
    /// Entity name used in error messages.
    const KIND: &'static str;

    fn id(&self) -> ObjectId;

    async fn find_by_id(db: &dyn DocumentStore, id: &ObjectId) -> Result<Self> {
        match db.find_by_id(Self::COLLECTION, id).await? {
            Some(doc) => Ok(serde_json::from_value(doc)?),
            None => Err(ApiError::NotFound(Self::KIND)),
        }
    }

    async fn exists(db: &dyn DocumentStore, id: &ObjectId) -> Result<bool> {
        Ok(db.find_by_id(Self::COLLECTION, id).await?.is_some())
    }

    async fn find(
        db: &dyn DocumentStore,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Self>> {
        db.find(Self::COLLECTION, filter, options)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(ApiError::from))
            .collect()
    }

    async fn create(&self, db: &dyn DocumentStore) -> Result<()> {
        self.validate()?;
        db.insert(Self::COLLECTION, &self.id(), serde_json::to_value(self)?)
            .await
            .map_err(write_error::<Self>)?;
        Ok(())
    }

    async fn update(&self, db: &dyn DocumentStore) -> Result<()> {
        self.validate()?;
        let replaced = db
            .replace(Self::COLLECTION, &self.id(), serde_json::to_value(self)?)
            .await
            .map_err(write_error::<Self>)?;
        if replaced {
            Ok(())
        } else {
            Err(ApiError::NotFound(Self::KIND))
        }
    }

    async fn delete(db: &dyn DocumentStore, id: &ObjectId) -> Result<()> {
        if db.delete(Self::COLLECTION, id).await? {
            Ok(())
        } else {
            Err(ApiError::NotFound(Self::KIND))
        }
    }
}

/// Typed lookups. Each model picks the query shapes it needs.
#[async_trait]
pub trait DbModel<GetQuery, ListQuery>: Document
where
    GetQuery: Sync,
    ListQuery: Sync,
{
    async fn get(db: &dyn DocumentStore, query: &GetQuery) -> Result<Self>;
    async fn list(db: &dyn DocumentStore, query: &ListQuery)
        -> Result<Vec<Self>>;
}

impl Document for Note {
    const COLLECTION: &'static str = "notes";
    const KIND: &'static str = "Note";

    fn id(&self) -> ObjectId {
        self.id
    }
}

impl Document for Comment {
    const COLLECTION: &'static str = "peerNotez_comments";
    const KIND: &'static str = "Comment";

    fn id(&self) -> ObjectId {
        self.id
    }
}

impl Document for User {
    const COLLECTION: &'static str = "peerNotez_users";
    const KIND: &'static str = "User";

    fn id(&self) -> ObjectId {
        self.id
    }
}

/// Every collection the application uses.
pub const COLLECTIONS: [&str; 3] =
    [Note::COLLECTION, Comment::COLLECTION, User::COLLECTION];

//
// Notes
//

pub struct GetNoteQuery {
    pub id: ObjectId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NoteSort {
    #[default]
    Newest,
    HighestRated,
    MostDownloaded,
}

impl NoteSort {
    pub fn from_param(param: Option<&str>) -> Self {
        match param {
            Some("highestRated") => Self::HighestRated,
            Some("mostDownloaded") => Self::MostDownloaded,
            _ => Self::Newest,
        }
    }

    fn as_sort(&self) -> Sort {
        match self {
            Self::Newest => Sort {
                field: "createdAt",
                key: SortKey::Timestamp,
                descending: true,
            },
            Self::HighestRated => Sort {
                field: "rating",
                key: SortKey::Number,
                descending: true,
            },
            Self::MostDownloaded => Sort {
                field: "downloadCount",
                key: SortKey::Number,
                descending: true,
            },
        }
    }
}

/// The note listing's search parameters. Blank strings and `"0"` mean "no
/// filter", matching what the UI sends for an unset select box.
#[derive(Clone, Debug, Default)]
pub struct ListNoteQuery {
    pub user: Option<ObjectId>,
    /// Restrict to these notes, e.g. a user's saved list.
    pub ids: Option<Vec<ObjectId>>,
    pub search: Option<String>,
    pub title: Option<String>,
    pub university: Option<String>,
    pub course: Option<String>,
    pub subject: Option<String>,
    pub year: Option<i32>,
    pub featured_only: bool,
    pub sort: NoteSort,
    /// 1-based
    pub page: i64,
    pub limit: i64,
}

fn is_unset(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v == "0"
}

/// `"a, b,,c"` -> `["a", "b", "c"]`
fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect()
}

impl ListNoteQuery {
    pub fn filter(&self) -> Filter {
        let mut filter = Filter::new();
        let set = |v: &Option<String>| -> Option<String> {
            v.as_deref().filter(|v| !is_unset(v)).map(str::to_owned)
        };

        if let Some(user) = self.user {
            filter = filter.eq("user", user);
        }
        if let Some(ids) = &self.ids {
            filter = filter.one_of("_id", ids.iter().copied());
        }
        let subject = set(&self.subject);
        if let Some(search) = set(&self.search) {
            // An explicit subject filter wins over searching in subjects.
            let mut fields = vec!["title", "university", "course"];
            if subject.is_none() {
                fields.push("subject");
            }
            filter = filter.contains_any(fields, vec![search.trim().to_owned()]);
        }
        if let Some(university) = set(&self.university) {
            filter = filter.contains_any(vec!["university"], split_csv(&university));
        }
        if let Some(course) = set(&self.course) {
            filter = filter.contains_any(vec!["course"], split_csv(&course));
        }
        if let Some(subject) = subject {
            filter = filter.contains_any(vec!["subject"], split_csv(&subject));
        }
        if let Some(title) = set(&self.title) {
            filter = filter.contains_any(vec!["title"], vec![title.trim().to_owned()]);
        }
        if let Some(year) = self.year.filter(|y| *y != 0) {
            filter = filter.eq("year", year);
        }
        if self.featured_only {
            filter = filter.eq("isFeatured", true);
        }

        filter
    }

    pub fn options(&self) -> FindOptions {
        let limit = self.page_size();
        FindOptions {
            sort: Some(self.sort.as_sort()),
            limit: Some(limit),
            skip: (self.page.max(1) - 1).saturating_mul(limit),
        }
    }

    pub fn page_size(&self) -> i64 {
        if self.limit <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.limit.min(MAX_PAGE_SIZE)
        }
    }
}

#[async_trait]
impl DbModel<GetNoteQuery, ListNoteQuery> for Note {
    async fn get(db: &dyn DocumentStore, query: &GetNoteQuery) -> Result<Self> {
        Note::find_by_id(db, &query.id).await
    }

    async fn list(
        db: &dyn DocumentStore,
        query: &ListNoteQuery,
    ) -> Result<Vec<Self>> {
        Note::find(db, &query.filter(), &query.options()).await
    }
}

pub async fn count_notes(
    db: &dyn DocumentStore,
    query: &ListNoteQuery,
) -> Result<i64> {
    Ok(db.count(Note::COLLECTION, &query.filter()).await?)
}

/// All of one user's notes, newest first.
pub async fn notes_by_user(
    db: &dyn DocumentStore,
    user: ObjectId,
) -> Result<Vec<Note>> {
    Note::find(
        db,
        &Filter::new().eq("user", user),
        &FindOptions::newest_first(),
    )
    .await
}

pub async fn increment_downloads(
    db: &dyn DocumentStore,
    id: &ObjectId,
) -> Result<()> {
    if db
        .increment(Note::COLLECTION, id, "downloadCount", 1)
        .await?
    {
        Ok(())
    } else {
        Err(ApiError::NotFound(Note::KIND))
    }
}

/// Delete a note and then, best effort, its comments and every saved-list
/// entry pointing at it. Returns how many comments went with it. Blob
/// storage is the caller's concern.
pub async fn delete_note(db: &dyn DocumentStore, note: &Note) -> Result<u64> {
    Note::delete(db, &note.id).await?;
    let unsaved = db
        .pull(
            User::COLLECTION,
            &Filter::new().has("savedNotes", note.id),
            "savedNotes",
            note.id.into(),
        )
        .await;
    match unsaved {
        Ok(n) => tracing::debug!(note = %note.id, users = n, "removed from saved lists"),
        Err(e) => {
            tracing::error!(note = %note.id, error = ?e, "stale saved-list entries left behind")
        }
    }
    let removed = db
        .delete_many(Comment::COLLECTION, &Filter::new().eq("note", note.id))
        .await;
    match removed {
        Ok(n) => Ok(n),
        Err(e) => {
            tracing::error!(note = %note.id, error = ?e, "orphaned comments left behind");
            Ok(0)
        }
    }
}

/// Pair each note with its author's name and avatar, loading every author
/// in one query.
pub async fn with_authors(
    db: &dyn DocumentStore,
    notes: Vec<Note>,
) -> Result<Vec<NoteView>> {
    let mut ids: Vec<ObjectId> = notes.iter().map(|n| n.user).collect();
    ids.sort();
    ids.dedup();
    let authors: HashMap<ObjectId, Author> = if ids.is_empty() {
        HashMap::new()
    } else {
        User::find(db, &Filter::new().one_of("_id", ids), &FindOptions::default())
            .await?
            .iter()
            .map(|u| (u.id, Author::from(u)))
            .collect()
    };

    Ok(notes
        .into_iter()
        .map(|note| NoteView {
            author: authors.get(&note.user).cloned(),
            note,
        })
        .collect())
}

//
// Comments
//

pub struct GetCommentQuery {
    pub id: ObjectId,
}

pub struct ListCommentQuery {
    pub note: ObjectId,
}

#[async_trait]
impl DbModel<GetCommentQuery, ListCommentQuery> for Comment {
    async fn get(
        db: &dyn DocumentStore,
        query: &GetCommentQuery,
    ) -> Result<Self> {
        Comment::find_by_id(db, &query.id).await
    }

    /// Oldest first, so threads read top to bottom.
    async fn list(
        db: &dyn DocumentStore,
        query: &ListCommentQuery,
    ) -> Result<Vec<Self>> {
        Comment::find(
            db,
            &Filter::new().eq("note", query.note),
            &FindOptions::oldest_first(),
        )
        .await
    }
}

/// Insert a comment after checking that its author and note exist. The
/// store has no foreign keys, so this check is the only thing keeping
/// comments from pointing at nothing.
pub async fn create_comment(
    db: &dyn DocumentStore,
    comment: &Comment,
) -> Result<()> {
    comment.validate()?;
    let (note_exists, user_exists) = futures::try_join!(
        Note::exists(db, &comment.note),
        User::exists(db, &comment.user)
    )?;
    if !note_exists {
        return Err(ApiError::validation(
            "note",
            format!("Note {} does not exist.", comment.note),
        ));
    }
    if !user_exists {
        return Err(ApiError::validation(
            "user",
            format!("User {} does not exist.", comment.user),
        ));
    }

    comment.create(db).await
}

//
// Users
//

pub enum GetUserQuery<'a> {
    Id(ObjectId),
    Email(&'a str),
}

pub struct ListUserQuery;

#[async_trait]
impl<'a> DbModel<GetUserQuery<'a>, ListUserQuery> for User {
    async fn get(
        db: &dyn DocumentStore,
        query: &GetUserQuery<'a>,
    ) -> Result<Self> {
        match query {
            GetUserQuery::Id(id) => User::find_by_id(db, id).await,
            GetUserQuery::Email(email) => User::find(
                db,
                &Filter::new().eq("email", normalize_email(email)),
                &FindOptions::default(),
            )
            .await?
            .into_iter()
            .next()
            .ok_or(ApiError::NotFound(User::KIND)),
        }
    }

    async fn list(
        db: &dyn DocumentStore,
        _query: &ListUserQuery,
    ) -> Result<Vec<Self>> {
        User::find(db, &Filter::new(), &FindOptions::newest_first()).await
    }
}

/// Add a note to the user's saved list. `false` when it was already there.
pub async fn save_note(
    db: &dyn DocumentStore,
    user: &ObjectId,
    note: &ObjectId,
) -> Result<bool> {
    if !Note::exists(db, note).await? {
        return Err(ApiError::NotFound(Note::KIND));
    }
    let added = db
        .add_to_set(
            User::COLLECTION,
            &Filter::new().eq("_id", *user),
            "savedNotes",
            Value::from(*note),
        )
        .await?;
    Ok(added > 0)
}

/// `false` when the note was not in the list.
pub async fn unsave_note(
    db: &dyn DocumentStore,
    user: &ObjectId,
    note: &ObjectId,
) -> Result<bool> {
    let removed = db
        .pull(
            User::COLLECTION,
            &Filter::new().eq("_id", *user),
            "savedNotes",
            Value::from(*note),
        )
        .await?;
    Ok(removed > 0)
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Keeps `noteCount` in step with uploads and deletions. A missing user is
/// logged rather than failing the note operation that triggered it.
pub async fn adjust_note_count(
    db: &dyn DocumentStore,
    user: &ObjectId,
    by: i64,
) -> AnyResult<()> {
    if !db
        .increment(User::COLLECTION, user, "noteCount", by)
        .await?
    {
        tracing::warn!(%user, "note count not adjusted; user is gone");
    }
    Ok(())
}
