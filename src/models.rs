use super::{
    config::Config, errors::ApiError, storage::ObjectStorage,
    store::DocumentStore,
};
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, sync::Arc};
use validator::Validate;

/// Shared, read-only handles every request handler gets a clone of.
#[derive(Clone, Debug)]
pub struct AppState {
    pub db: Arc<dyn DocumentStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub config: Arc<Config>,
}

/// 12-byte document identifier: 4 bytes of big-endian unix seconds followed
/// by 8 random bytes. Rendered as 24 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let secs = Utc::now().timestamp() as u32;
        let tail: [u8; 8] = rand::random();
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..].copy_from_slice(&tail);
        Self(bytes)
    }

    /// Parse an identifier supplied by a client. `path` names where it came
    /// from, for the error message.
    pub fn parse(path: &'static str, value: &str) -> Result<Self, ApiError> {
        value.parse().map_err(|_| ApiError::Cast {
            path,
            value: value.to_owned(),
        })
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidObjectId;

impl fmt::Display for InvalidObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected 24 hex characters")
    }
}

impl std::error::Error for InvalidObjectId {}

impl FromStr for ObjectId {
    type Err = InvalidObjectId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(InvalidObjectId);
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| InvalidObjectId)?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl From<ObjectId> for serde_json::Value {
    fn from(id: ObjectId) -> Self {
        serde_json::Value::String(id.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[validate(length(min = 1, message = "Path `name` is required."))]
    pub name: String,
    #[validate(email(message = "Path `email` is invalid."))]
    pub email: String,
    /// argon2 PHC string
    #[validate(length(min = 1, message = "Path `password` is required."))]
    pub password: String,
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub note_count: i64,
    #[serde(default)]
    pub saved_notes: Vec<ObjectId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// What the API exposes about a user; never includes the password hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub role: Role,
    pub note_count: i64,
    #[serde(default)]
    pub saved_notes: Vec<ObjectId>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            avatar: user.avatar.clone(),
            role: user.role,
            note_count: user.note_count,
            saved_notes: user.saved_notes.clone(),
        }
    }
}

/// The slice of a user shown next to their notes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Author {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub avatar: Option<String>,
}

impl From<&User> for Author {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            avatar: user.avatar.clone(),
        }
    }
}

/// Where a note's file lives in blob storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    /// Public URL returned by the storage provider.
    pub file_path: String,
    pub file_type: String,
    pub file_size: i64,
    pub public_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user: ObjectId,
    #[validate(range(min = 1, max = 5, message = "Rating must be between 1 and 5."))]
    pub rating: Option<u8>,
    #[validate(length(min = 1, message = "Path `comment` is required."))]
    pub comment: String,
    pub parent_review_id: Option<ObjectId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[validate(length(min = 1, message = "Path `title` is required."))]
    pub title: String,
    #[validate(length(
        min = 20,
        message = "Description must be at least 20 characters long"
    ))]
    pub description: String,
    #[validate(length(min = 1, message = "Path `university` is required."))]
    pub university: String,
    #[validate(length(min = 1, message = "Path `course` is required."))]
    pub course: String,
    #[validate(length(min = 1, message = "Path `subject` is required."))]
    pub subject: String,
    #[validate(range(min = 1900, max = 2100, message = "Path `year` is invalid."))]
    pub year: i32,
    pub attachment: Option<Attachment>,
    pub user: ObjectId,
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub num_reviews: i64,
    #[serde(default)]
    pub download_count: i64,
    #[serde(default)]
    pub is_featured: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A note as listings return it. `author` is `None` once the owner's
/// account is gone.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NoteView {
    #[serde(flatten)]
    pub note: Note,
    pub author: Option<Author>,
}

/// The fields a note author supplies, on upload and on edit.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub university: Option<String>,
    pub course: Option<String>,
    pub subject: Option<String>,
    pub year: Option<i32>,
}

impl Note {
    /// A new note owned by `user`. Text fields are trimmed; required fields
    /// left out end up empty and are rejected when the note is validated.
    pub fn new(user: ObjectId, fields: NoteFields) -> Self {
        let now = Utc::now();
        let mut note = Self {
            id: ObjectId::new(),
            title: String::new(),
            description: String::new(),
            university: String::new(),
            course: String::new(),
            subject: String::new(),
            year: 0,
            attachment: None,
            user,
            reviews: Vec::new(),
            rating: 0.0,
            num_reviews: 0,
            download_count: 0,
            is_featured: false,
            created_at: now,
            updated_at: now,
        };
        note.apply(fields);
        note
    }

    /// Overwrite the fields that are present; absent ones are left alone.
    pub fn apply(&mut self, fields: NoteFields) {
        let trim = |s: String| s.trim().to_owned();
        if let Some(v) = fields.title {
            self.title = trim(v);
        }
        if let Some(v) = fields.description {
            self.description = trim(v);
        }
        if let Some(v) = fields.university {
            self.university = trim(v);
        }
        if let Some(v) = fields.course {
            self.course = trim(v);
        }
        if let Some(v) = fields.subject {
            self.subject = trim(v);
        }
        if let Some(v) = fields.year {
            self.year = v;
        }
        self.updated_at = Utc::now();
    }

    pub fn is_owned_by(&self, user: &User) -> bool {
        self.user == user.id
    }

    /// Add a review or, with `parent`, a reply to one. Each user gets one
    /// top-level review per note, and it must carry a 1..=5 rating. Replies
    /// are unrated. Returns the stored review.
    pub fn add_review(
        &mut self,
        user: ObjectId,
        rating: Option<u8>,
        comment: String,
        parent: Option<ObjectId>,
    ) -> Result<Review, ApiError> {
        let rating = match parent {
            Some(parent_id) => {
                if !self.reviews.iter().any(|r| r.id == parent_id) {
                    return Err(ApiError::validation(
                        "parentReviewId",
                        "The review being replied to does not exist.",
                    ));
                }
                None
            }
            None => {
                let already_reviewed = self
                    .reviews
                    .iter()
                    .any(|r| r.user == user && r.parent_review_id.is_none());
                if already_reviewed {
                    return Err(ApiError::validation(
                        "user",
                        "You have already posted a top-level review for this note.",
                    ));
                }
                Some(rating.unwrap_or(0))
            }
        };
        let review = Review {
            id: ObjectId::new(),
            user,
            rating,
            comment: comment.trim().to_owned(),
            parent_review_id: parent,
            created_at: Utc::now(),
        };
        review.validate()?;

        self.reviews.push(review.clone());
        if review.parent_review_id.is_none() {
            self.update_review_stats();
        }
        self.updated_at = Utc::now();

        Ok(review)
    }

    /// Only rated top-level reviews count towards `rating`/`numReviews`.
    pub fn update_review_stats(&mut self) {
        let rated: Vec<f64> = self
            .reviews
            .iter()
            .filter(|r| r.parent_review_id.is_none())
            .filter_map(|r| r.rating)
            .filter(|r| *r > 0)
            .map(f64::from)
            .collect();
        self.num_reviews = rated.len() as i64;
        self.rating = if rated.is_empty() {
            0.0
        } else {
            rated.iter().sum::<f64>() / rated.len() as f64
        };
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[validate(length(min = 1, message = "Path `text` is required."))]
    pub text: String,
    pub user: ObjectId,
    pub note: ObjectId,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(user: ObjectId, note: ObjectId, text: String) -> Self {
        Self {
            id: ObjectId::new(),
            text,
            user,
            note,
            created_at: Utc::now(),
        }
    }
}
