//! Posts, comments, categories and like/dislike reactions.

pub mod comments;
pub mod posts;
pub mod reactions;
