pub mod grammar;
pub mod reconciler;

pub use grammar::{
    elapsed_ms, parse_live_chat_message, parse_transcript_line, team_key, ChatEvent,
    ChatEventKind,
};
pub use reconciler::{AnchorSource, BracketedSpan, ChatAnchor, ChatReconciler, ReconcileOutcome};
