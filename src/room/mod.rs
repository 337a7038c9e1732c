mod state;
mod view;

pub use state::{Participant, ParticipantId, ParticipantInfo, Room};
pub use view::{ViewMode, ViewState};
