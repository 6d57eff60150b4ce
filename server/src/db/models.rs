/// Database row types.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.

/// User record in the users table
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub gender: String,
    pub age: i64,
    pub nickname: String,
    pub password_hash: String,
    pub created_at: String,
}

/// Forum post
#[derive(Debug, Clone)]
pub struct PostRow {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub created_at: String,
}

/// Comment on a post
#[derive(Debug, Clone)]
pub struct CommentRow {
    pub id: i64,
    pub post_id: i64,
    pub user_id: i64,
    pub content: String,
    pub created_at: String,
}

/// Private message between two users
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    pub created_at: String,
}
