//! Collaborators the core drives but does not implement: the animated avatar
//! and the text/routing overlay.

use crate::events::{Notice, Routing};

/// Emotion, gesture and lipsync consumer.
pub trait AvatarReactor: Send {
    fn set_emotion(&mut self, name: &str);
    fn play_gesture(&mut self, name: &str);
    /// Called once per render frame with the current output amplitude (0..1).
    fn set_amplitude(&mut self, amplitude: f32);
}

/// Subtitle, routing card and notice overlay.
pub trait SubtitlePresenter: Send {
    fn show_user_text(&mut self, text: &str);
    fn show_answer(&mut self, text: &str, subtitles: bool);
    fn show_routing(&mut self, routing: &Routing);
    fn show_video(&mut self, url: &str);
    fn show_notice(&mut self, notice: &Notice);
    /// The turn is over; clear transient text.
    fn clear(&mut self);
}
