use super::{
    auth::{self, AuthResponse, LoginForm, RegisterForm},
    db_ops::{
        self, DbModel, Document, GetCommentQuery, GetNoteQuery, GetUserQuery,
        ListCommentQuery, ListNoteQuery, ListUserQuery, NoteSort,
    },
    errors::ApiError,
    extractors::{AdminUser, AuthenticatedUser, Json, Path, Query},
    models::{
        AppState, Attachment, Comment, Note, NoteFields, NoteView, ObjectId,
        PublicUser, Review, Role, User,
    },
    storage::{FileData, ResourceType, StorageError, UploadOptions},
    store::DocumentStore,
};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

type Result<T> = std::result::Result<T, ApiError>;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "UP", "timestamp": Utc::now() }))
}

//
// Auth
//

pub async fn register(
    State(AppState { db, config, .. }): State<AppState>,
    Json(form): Json<RegisterForm>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let res = auth::register(&*db, &config.session_secret, form).await?;
    Ok((StatusCode::CREATED, Json(res)))
}

pub async fn login(
    State(AppState { db, config, .. }): State<AppState>,
    Json(form): Json<LoginForm>,
) -> Result<Json<AuthResponse>> {
    Ok(Json(
        auth::authenticate(&*db, &config.session_secret, form).await?,
    ))
}

//
// Notes
//

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNotesParams {
    page: Option<i64>,
    limit: Option<i64>,
    search: Option<String>,
    title: Option<String>,
    university: Option<String>,
    course: Option<String>,
    subject: Option<String>,
    year: Option<String>,
    is_featured: Option<String>,
    sort: Option<String>,
}

/// Any value except blank, `false` or `0` turns the flag on.
fn is_truthy(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") | Some("0") => false,
        Some(v) => !v.eq_ignore_ascii_case("false"),
    }
}

impl ListNotesParams {
    fn into_query(self) -> Result<ListNoteQuery> {
        let year = match self.year.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(y) => Some(y.parse::<i32>().map_err(|_| {
                ApiError::validation("year", "Year must be a number.")
            })?),
        };
        let featured_only = is_truthy(self.is_featured.as_deref());
        // Featured listings are always newest first.
        let sort = if featured_only {
            NoteSort::Newest
        } else {
            NoteSort::from_param(self.sort.as_deref())
        };
        Ok(ListNoteQuery {
            user: None,
            ids: None,
            search: self.search,
            title: self.title,
            university: self.university,
            course: self.course,
            subject: self.subject,
            year,
            featured_only,
            sort,
            page: self.page.unwrap_or(1).max(1),
            limit: self.limit.unwrap_or(0),
        })
    }
}

/// A page of notes as a JSON array; totals ride along in headers.
pub async fn list_notes(
    State(AppState { db, .. }): State<AppState>,
    Query(params): Query<ListNotesParams>,
) -> Result<impl IntoResponse> {
    let query = params.into_query()?;
    let (notes, count) = futures::try_join!(
        Note::list(&*db, &query),
        db_ops::count_notes(&*db, &query)
    )?;
    let notes = db_ops::with_authors(&*db, notes).await?;
    let page_size = query.page_size();
    let total_pages = (count + page_size - 1) / page_size;

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-total-count"),
        HeaderValue::from(count),
    );
    headers.insert(
        HeaderName::from_static("x-total-pages"),
        HeaderValue::from(total_pages),
    );

    Ok((headers, Json(notes)))
}

pub async fn my_notes(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Json<Vec<NoteView>>> {
    let notes = db_ops::notes_by_user(&*db, user.id).await?;
    Ok(Json(db_ops::with_authors(&*db, notes).await?))
}

pub async fn user_notes(
    State(AppState { db, .. }): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<NoteView>>> {
    let user_id = ObjectId::parse("userId", &user_id)?;
    let notes = db_ops::notes_by_user(&*db, user_id).await?;
    Ok(Json(db_ops::with_authors(&*db, notes).await?))
}

pub async fn get_note(
    State(AppState { db, .. }): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NoteView>> {
    let id = ObjectId::parse("_id", &id)?;
    let note = Note::get(&*db, &GetNoteQuery { id }).await?;
    let mut views = db_ops::with_authors(&*db, vec![note]).await?;
    views.pop().map(Json).ok_or(ApiError::NotFound(Note::KIND))
}

fn set_text_field(fields: &mut NoteFields, name: &str, value: String) -> Result<()> {
    match name {
        "title" => fields.title = Some(value),
        "description" => fields.description = Some(value),
        "university" => fields.university = Some(value),
        "course" => fields.course = Some(value),
        "subject" => fields.subject = Some(value),
        "year" => {
            let year = value.trim().parse::<i32>().map_err(|_| {
                ApiError::validation("year", "Year must be a number.")
            })?;
            fields.year = Some(year);
        }
        _ => tracing::debug!(field = name, "ignoring unknown upload field"),
    }
    Ok(())
}

/// Multipart upload of one file plus the note's fields. The note is
/// validated before anything is sent to blob storage, and the blob is
/// removed again if the note cannot be stored.
pub async fn upload_note(
    State(AppState { db, storage, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<Note>)> {
    let mut multipart = multipart?;
    let mut fields = NoteFields::default();
    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation("file", format!("File upload error: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("file").to_owned();
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_owned();
            let bytes = field.bytes().await.map_err(|e| {
                ApiError::validation("file", format!("File upload error: {e}"))
            })?;
            file = Some(FileData {
                file_name,
                content_type,
                bytes: bytes.to_vec(),
            });
        } else {
            let value = field.text().await.map_err(|e| {
                ApiError::validation(&name, format!("Unreadable field: {e}"))
            })?;
            set_text_field(&mut fields, &name, value)?;
        }
    }

    let file = file.ok_or_else(|| {
        ApiError::validation("file", "No file uploaded or file type not supported.")
    })?;
    let resource_type =
        ResourceType::classify(&file.content_type).ok_or_else(|| {
            ApiError::validation(
                "file",
                "Unsupported file type. Please upload a PDF, image, or office document.",
            )
        })?;

    let mut note = Note::new(user.id, fields);
    note.validate()?;

    let options = UploadOptions::for_attachment(&file, resource_type);
    let file_name = file.file_name.clone();
    let file_type = file.content_type.clone();
    let file_size = file.bytes.len() as i64;
    let uploaded = storage.upload(file, &options).await?;
    note.attachment = Some(Attachment {
        file_name,
        file_path: uploaded.url,
        file_type,
        file_size,
        public_id: uploaded.public_id,
    });

    if let Err(e) = note.create(&*db).await {
        if let Some(attachment) = &note.attachment {
            if let Err(cleanup) =
                storage.delete(&attachment.public_id, resource_type).await
            {
                tracing::error!(
                    public_id = %attachment.public_id,
                    error = %cleanup,
                    "orphaned upload left in storage"
                );
            }
        }
        return Err(e);
    }
    if let Err(e) = db_ops::adjust_note_count(&*db, &user.id, 1).await {
        tracing::error!(user = %user.id, error = ?e, "failed to bump note count");
    }
    tracing::info!(note = %note.id, user = %user.id, "note uploaded");

    Ok((StatusCode::CREATED, Json(note)))
}

/// Only the descriptive fields can change; the attachment is fixed.
pub async fn update_note(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
    Json(fields): Json<NoteFields>,
) -> Result<Json<Note>> {
    let id = ObjectId::parse("_id", &id)?;
    let mut note = Note::get(&*db, &GetNoteQuery { id }).await?;
    if !note.is_owned_by(&user) {
        return Err(ApiError::unauthorized("not allowed to update this note"));
    }
    note.apply(fields);
    note.update(&*db).await?;

    Ok(Json(note))
}

pub async fn download_note(
    State(AppState { db, .. }): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = ObjectId::parse("_id", &id)?;
    db_ops::increment_downloads(&*db, &id).await?;

    Ok(Json(json!({ "message": "Download count updated" })))
}

pub async fn toggle_featured(
    State(AppState { db, .. }): State<AppState>,
    AdminUser(_): AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = ObjectId::parse("_id", &id)?;
    let mut note = Note::get(&*db, &GetNoteQuery { id }).await?;
    note.is_featured = !note.is_featured;
    note.updated_at = Utc::now();
    note.update(&*db).await?;

    Ok(Json(json!({
        "message": format!("Note's featured status updated to {}.", note.is_featured),
        "isFeatured": note.is_featured,
    })))
}

/// Blob first, then the note, then its comments. A blob that is already
/// gone does not block the delete.
pub async fn delete_note(
    State(AppState { db, storage, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = ObjectId::parse("_id", &id)?;
    let note = Note::get(&*db, &GetNoteQuery { id }).await?;
    if !note.is_owned_by(&user) && !user.is_admin() {
        return Err(ApiError::unauthorized("not allowed to delete this note"));
    }

    if let Some(attachment) = &note.attachment {
        let resource_type = ResourceType::classify(&attachment.file_type)
            .unwrap_or(ResourceType::Raw);
        match storage.delete(&attachment.public_id, resource_type).await {
            Ok(()) => (),
            Err(StorageError::NotFound(_)) => tracing::warn!(
                public_id = %attachment.public_id,
                "attachment already missing from storage"
            ),
            Err(e) => return Err(e.into()),
        }
    }
    let comments = db_ops::delete_note(&*db, &note).await?;
    if let Err(e) = db_ops::adjust_note_count(&*db, &note.user, -1).await {
        tracing::error!(user = %note.user, error = ?e, "failed to drop note count");
    }
    tracing::info!(note = %note.id, comments, "note deleted");

    Ok(Json(json!({ "message": "Note removed successfully" })))
}

//
// Reviews
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewForm {
    rating: Option<u8>,
    #[serde(default)]
    comment: String,
    parent_review_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReviewCreated {
    message: &'static str,
    review: Review,
}

pub async fn add_review(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
    Json(form): Json<ReviewForm>,
) -> Result<(StatusCode, Json<ReviewCreated>)> {
    let id = ObjectId::parse("_id", &id)?;
    let parent = form
        .parent_review_id
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| ObjectId::parse("parentReviewId", p))
        .transpose()?;

    let mut note = Note::get(&*db, &GetNoteQuery { id }).await?;
    let review = note.add_review(user.id, form.rating, form.comment, parent)?;
    note.update(&*db).await?;

    Ok((
        StatusCode::CREATED,
        Json(ReviewCreated {
            message: "Review added successfully!",
            review,
        }),
    ))
}

//
// Comments
//

#[derive(Debug, Deserialize)]
pub struct CommentForm {
    #[serde(default)]
    text: String,
}

pub async fn list_comments(
    State(AppState { db, .. }): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Comment>>> {
    let note = ObjectId::parse("note", &id)?;
    if !Note::exists(&*db, &note).await? {
        return Err(ApiError::NotFound(Note::KIND));
    }

    Ok(Json(Comment::list(&*db, &ListCommentQuery { note }).await?))
}

pub async fn add_comment(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
    Json(form): Json<CommentForm>,
) -> Result<(StatusCode, Json<Comment>)> {
    let note = ObjectId::parse("note", &id)?;
    let comment = Comment::new(user.id, note, form.text.trim().to_owned());
    db_ops::create_comment(&*db, &comment).await?;

    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn delete_comment(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = ObjectId::parse("_id", &id)?;
    let comment = Comment::get(&*db, &GetCommentQuery { id }).await?;
    if comment.user != user.id && !user.is_admin() {
        return Err(ApiError::unauthorized("not allowed to delete this comment"));
    }
    Comment::delete(&*db, &comment.id).await?;

    Ok(Json(json!({ "message": "Comment removed" })))
}

//
// Users
//

#[derive(Debug, Deserialize)]
pub struct ProfileForm {
    name: Option<String>,
    email: Option<String>,
}

pub async fn get_profile(
    AuthenticatedUser(user): AuthenticatedUser,
) -> Json<PublicUser> {
    Json(PublicUser::from(&user))
}

/// Blank fields are left as they are.
pub async fn update_profile(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(mut user): AuthenticatedUser,
    Json(form): Json<ProfileForm>,
) -> Result<Json<PublicUser>> {
    let given = |v: &Option<String>| {
        v.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_owned)
    };
    if let Some(name) = given(&form.name) {
        user.name = name;
    }
    if let Some(email) = given(&form.email) {
        user.email = db_ops::normalize_email(&email);
    }
    user.updated_at = Utc::now();
    user.update(&*db).await?;

    Ok(Json(PublicUser::from(&user)))
}

async fn saved_notes_count(db: &dyn DocumentStore, user: ObjectId) -> Result<usize> {
    let user = User::get(db, &GetUserQuery::Id(user)).await?;
    Ok(user.saved_notes.len())
}

pub async fn save_note(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(note_id): Path<String>,
) -> Result<impl IntoResponse> {
    let note = ObjectId::parse("noteId", &note_id)?;
    let added = db_ops::save_note(&*db, &user.id, &note).await?;
    let message = if added {
        "Note saved successfully!"
    } else {
        "Note already saved."
    };

    Ok(Json(json!({
        "message": message,
        "savedNotesCount": saved_notes_count(&*db, user.id).await?,
    })))
}

pub async fn unsave_note(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(note_id): Path<String>,
) -> Result<impl IntoResponse> {
    let note = ObjectId::parse("noteId", &note_id)?;
    let removed = db_ops::unsave_note(&*db, &user.id, &note).await?;
    let message = if removed {
        "Note unsaved successfully!"
    } else {
        "Note was not found in saved list."
    };

    Ok(Json(json!({
        "message": message,
        "savedNotesCount": saved_notes_count(&*db, user.id).await?,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedNotesPage {
    notes: Vec<NoteView>,
    page: i64,
    total_pages: i64,
    total_notes: i64,
}

pub async fn saved_notes(
    State(AppState { db, .. }): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Query(params): Query<PageParams>,
) -> Result<Json<SavedNotesPage>> {
    let query = ListNoteQuery {
        ids: Some(user.saved_notes),
        page: params.page.unwrap_or(1).max(1),
        limit: params.limit.unwrap_or(0),
        ..Default::default()
    };
    let (notes, total_notes) = futures::try_join!(
        Note::list(&*db, &query),
        db_ops::count_notes(&*db, &query)
    )?;
    let page_size = query.page_size();

    Ok(Json(SavedNotesPage {
        notes: db_ops::with_authors(&*db, notes).await?,
        page: query.page,
        total_pages: (total_notes + page_size - 1) / page_size,
        total_notes,
    }))
}

pub async fn list_users(
    State(AppState { db, .. }): State<AppState>,
    AdminUser(_): AdminUser,
) -> Result<Json<Vec<PublicUser>>> {
    let users = User::list(&*db, &ListUserQuery).await?;
    Ok(Json(users.iter().map(PublicUser::from).collect()))
}

/// The user's notes and comments stay behind.
pub async fn delete_user(
    State(AppState { db, .. }): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = ObjectId::parse("_id", &id)?;
    if id == admin.id {
        return Err(ApiError::validation("_id", "Cannot delete yourself as an admin."));
    }
    User::delete(&*db, &id).await?;
    tracing::info!(user = %id, admin = %admin.id, "user deleted");

    Ok(Json(json!({ "message": "User removed successfully" })))
}

pub async fn toggle_role(
    State(AppState { db, .. }): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = ObjectId::parse("_id", &id)?;
    if id == admin.id {
        return Err(ApiError::validation(
            "_id",
            "Cannot change your own role via this endpoint.",
        ));
    }
    let mut user = User::get(&*db, &GetUserQuery::Id(id)).await?;
    user.role = match user.role {
        Role::Admin => Role::User,
        Role::User => Role::Admin,
    };
    user.updated_at = Utc::now();
    user.update(&*db).await?;
    tracing::info!(user = %id, role = ?user.role, "role changed");

    Ok(Json(json!({
        "message": format!("User role for {} updated to {}", user.name, user.role.as_str()),
        "userId": user.id,
        "newRole": user.role,
    })))
}
