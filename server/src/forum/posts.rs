//! Post creation, listing and detail views.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::session::Identity;
use crate::db::models::{CommentRow, PostRow};
use crate::error::{lock_db, ApiError};
use crate::forum::reactions::{reaction_counts, reaction_of, ContentType, ReactionState};
use crate::state::AppState;

pub const MAX_TITLE_LENGTH: usize = 200;
pub const MAX_POST_LENGTH: usize = 10_000;
const MAX_CATEGORY_LENGTH: usize = 50;
const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

// --- Request / Response types ---

#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListPostsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub category: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub nickname: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostSummary {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author: Author,
    pub categories: Vec<String>,
    pub created_at: String,
    pub likes: i64,
    pub dislikes: i64,
    pub comment_count: i64,
    /// The requesting user's own reaction
    pub reaction: ReactionState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostPage {
    pub posts: Vec<PostSummary>,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommentView {
    pub id: i64,
    pub post_id: i64,
    pub author: Author,
    pub content: String,
    pub created_at: String,
    pub likes: i64,
    pub dislikes: i64,
    pub reaction: ReactionState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostDetail {
    #[serde(flatten)]
    pub post: PostSummary,
    pub comments: Vec<CommentView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CategoryCount {
    pub name: String,
    pub post_count: i64,
}

// --- Validation ---

/// Trim, drop blanks and deduplicate (first occurrence wins, case-insensitive).
fn normalize_categories(raw: &[String]) -> Result<Vec<String>, ApiError> {
    let mut categories: Vec<String> = Vec::new();
    for name in raw.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        if name.chars().count() > MAX_CATEGORY_LENGTH {
            return Err(ApiError::bad_request(format!(
                "Category names are limited to {} characters",
                MAX_CATEGORY_LENGTH
            )));
        }
        if !categories.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            categories.push(name.to_string());
        }
    }
    if categories.is_empty() {
        return Err(ApiError::bad_request("At least one category is required"));
    }
    Ok(categories)
}

fn validate_post(req: &CreatePostRequest) -> Result<(String, String, Vec<String>), ApiError> {
    let title = req.title.trim();
    let content = req.content.trim();
    if title.is_empty() || content.is_empty() {
        return Err(ApiError::bad_request("Title and content are required"));
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Title exceeds {} characters",
            MAX_TITLE_LENGTH
        )));
    }
    if content.chars().count() > MAX_POST_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Content exceeds {} characters",
            MAX_POST_LENGTH
        )));
    }
    let categories = normalize_categories(&req.categories)?;
    Ok((title.to_string(), content.to_string(), categories))
}

// --- Queries ---

/// Insert a post and its categories atomically.
pub fn insert_post(
    conn: &mut Connection,
    user_id: i64,
    title: &str,
    content: &str,
    categories: &[String],
) -> Result<i64, rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO posts (user_id, title, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![user_id, title, content, Utc::now().to_rfc3339()],
    )?;
    let post_id = tx.last_insert_rowid();
    {
        let mut stmt =
            tx.prepare("INSERT INTO post_categories (post_id, category) VALUES (?1, ?2)")?;
        for category in categories {
            stmt.execute(rusqlite::params![post_id, category])?;
        }
    }
    tx.commit()?;
    Ok(post_id)
}

fn post_categories(conn: &Connection, post_id: i64) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT category FROM post_categories WHERE post_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map([post_id], |row| row.get(0))?;
    rows.collect()
}

/// Decorate a bare post row with author, categories and reaction data.
fn summarize(
    conn: &Connection,
    post: PostRow,
    author_nickname: String,
    viewer_id: i64,
) -> Result<PostSummary, rusqlite::Error> {
    let (likes, dislikes) = reaction_counts(conn, ContentType::Post, post.id)?;
    let comment_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM comments WHERE post_id = ?1",
        [post.id],
        |row| row.get(0),
    )?;
    Ok(PostSummary {
        categories: post_categories(conn, post.id)?,
        reaction: reaction_of(conn, ContentType::Post, post.id, viewer_id)?,
        author: Author {
            id: post.user_id,
            nickname: author_nickname,
        },
        id: post.id,
        title: post.title,
        content: post.content,
        created_at: post.created_at,
        likes,
        dislikes,
        comment_count,
    })
}

fn post_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(PostRow, String)> {
    Ok((
        PostRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
        },
        row.get(5)?,
    ))
}

/// Newest-first page of posts, optionally restricted to one category.
/// Fetches one extra row to decide `has_more`.
pub fn list_posts(
    conn: &Connection,
    viewer_id: i64,
    category: Option<&str>,
    limit: u32,
    offset: u64,
) -> Result<(Vec<PostSummary>, bool), rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.user_id, p.title, p.content, p.created_at, u.nickname
         FROM posts p
         JOIN users u ON u.id = p.user_id
         WHERE ?1 IS NULL
            OR EXISTS (SELECT 1 FROM post_categories pc
                       WHERE pc.post_id = p.id AND pc.category = ?1 COLLATE NOCASE)
         ORDER BY p.created_at DESC, p.id DESC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows: Vec<(PostRow, String)> = stmt
        .query_map(
            rusqlite::params![category, i64::from(limit) + 1, offset as i64],
            post_from_row,
        )?
        .collect::<Result<_, _>>()?;

    let has_more = rows.len() > limit as usize;
    let posts = rows
        .into_iter()
        .take(limit as usize)
        .map(|(post, nickname)| summarize(conn, post, nickname, viewer_id))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((posts, has_more))
}

pub fn find_post(
    conn: &Connection,
    post_id: i64,
    viewer_id: i64,
) -> Result<Option<PostSummary>, rusqlite::Error> {
    let row = conn
        .query_row(
            "SELECT p.id, p.user_id, p.title, p.content, p.created_at, u.nickname
             FROM posts p JOIN users u ON u.id = p.user_id
             WHERE p.id = ?1",
            [post_id],
            post_from_row,
        )
        .optional()?;

    row.map(|(post, nickname)| summarize(conn, post, nickname, viewer_id))
        .transpose()
}

/// Comments of a post, oldest first, with reaction data.
pub fn post_comments(
    conn: &Connection,
    post_id: i64,
    viewer_id: i64,
) -> Result<Vec<CommentView>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.post_id, c.user_id, c.content, c.created_at, u.nickname
         FROM comments c JOIN users u ON u.id = c.user_id
         WHERE c.post_id = ?1
         ORDER BY c.created_at ASC, c.id ASC",
    )?;
    let rows: Vec<(CommentRow, String)> = stmt
        .query_map([post_id], |row| {
            Ok((
                CommentRow {
                    id: row.get(0)?,
                    post_id: row.get(1)?,
                    user_id: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                },
                row.get(5)?,
            ))
        })?
        .collect::<Result<_, _>>()?;

    rows.into_iter()
        .map(|(comment, nickname)| {
            let (likes, dislikes) = reaction_counts(conn, ContentType::Comment, comment.id)?;
            Ok(CommentView {
                reaction: reaction_of(conn, ContentType::Comment, comment.id, viewer_id)?,
                author: Author {
                    id: comment.user_id,
                    nickname,
                },
                id: comment.id,
                post_id: comment.post_id,
                content: comment.content,
                created_at: comment.created_at,
                likes,
                dislikes,
            })
        })
        .collect()
}

pub fn category_counts(conn: &Connection) -> Result<Vec<CategoryCount>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*) FROM post_categories
         GROUP BY category COLLATE NOCASE
         ORDER BY category COLLATE NOCASE",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CategoryCount {
            name: row.get(0)?,
            post_count: row.get(1)?,
        })
    })?;
    rows.collect()
}

// --- Handlers ---

/// POST /api/posts
pub async fn create_post(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let (title, content, categories) = validate_post(&req)?;
    let db = state.db.clone();
    let user_id = identity.user_id;

    let post_id = tokio::task::spawn_blocking(move || -> Result<i64, ApiError> {
        let mut conn = lock_db(&db)?;
        Ok(insert_post(&mut conn, user_id, &title, &content, &categories)?)
    })
    .await??;

    tracing::info!(user_id, post_id, "Post created");

    Ok((StatusCode::CREATED, Json(CreatedResponse { id: post_id })))
}

/// GET /api/posts?page=&limit=&category=
pub async fn list(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListPostsQuery>,
) -> Result<Json<PostPage>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = u64::from(page - 1) * u64::from(limit);
    let category = query
        .category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    let db = state.db.clone();

    let (posts, has_more) = tokio::task::spawn_blocking(move || {
        let conn = lock_db(&db)?;
        Ok::<_, ApiError>(list_posts(
            &conn,
            identity.user_id,
            category.as_deref(),
            limit,
            offset,
        )?)
    })
    .await??;

    Ok(Json(PostPage {
        posts,
        page,
        limit,
        has_more,
    }))
}

/// GET /api/posts/{id}
pub async fn get_post(
    State(state): State<AppState>,
    identity: Identity,
    Path(post_id): Path<i64>,
) -> Result<Json<PostDetail>, ApiError> {
    let db = state.db.clone();

    let detail = tokio::task::spawn_blocking(move || -> Result<PostDetail, ApiError> {
        let conn = lock_db(&db)?;
        let post = find_post(&conn, post_id, identity.user_id)?
            .ok_or_else(|| ApiError::not_found(format!("post {} does not exist", post_id)))?;
        let comments = post_comments(&conn, post_id, identity.user_id)?;
        Ok(PostDetail { post, comments })
    })
    .await??;

    Ok(Json(detail))
}

/// GET /api/categories
pub async fn list_categories(
    State(state): State<AppState>,
    _identity: Identity,
) -> Result<Json<Vec<CategoryCount>>, ApiError> {
    let db = state.db.clone();
    let categories = tokio::task::spawn_blocking(move || {
        let conn = lock_db(&db)?;
        Ok::<_, ApiError>(category_counts(&conn)?)
    })
    .await??;

    Ok(Json(categories))
}
