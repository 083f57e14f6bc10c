//! Hub broadcasts for forum activity.
//!
//! The post/comment CRUD layer calls these after a successful write. Every
//! helper is fire-and-forget: when the broadcast queue is saturated the
//! event is dropped and the write itself is unaffected.

use crate::db::models::{Comment, Identity, Post};
use crate::hub::Hub;
use crate::ws::events::WireEvent;

/// Broadcast a freshly created post to all connected clients.
pub fn publish_post_created(hub: &Hub, post: Post) -> bool {
    hub.broadcast(WireEvent::PostCreated { post })
}

/// Broadcast a new comment together with the post's updated comment count.
pub fn publish_comment_created(hub: &Hub, comment: Comment, comment_count: i64) -> bool {
    hub.broadcast(WireEvent::CommentCreated {
        post_id: comment.post_id,
        comment_count,
        comment,
    })
}

/// Broadcast updated like/dislike totals of a post.
pub fn publish_post_reaction(hub: &Hub, post_id: i64, likes: i64, dislikes: i64) -> bool {
    hub.broadcast(WireEvent::PostReaction {
        post_id,
        likes,
        dislikes,
    })
}

/// Broadcast updated like/dislike totals of a comment. The comment carries
/// the same totals so clients can replace it wholesale.
pub fn publish_comment_reaction(hub: &Hub, comment: Comment) -> bool {
    hub.broadcast(WireEvent::CommentReaction {
        post_id: comment.post_id,
        comment_id: comment.id,
        likes: comment.likes,
        dislikes: comment.dislikes,
        comment,
    })
}

/// Announce a newly registered user so open rosters can add them.
pub fn publish_user_created(hub: &Hub, user_id: Identity, username: &str) -> bool {
    hub.broadcast(WireEvent::UserCreated {
        user_id,
        username: username.to_string(),
    })
}
