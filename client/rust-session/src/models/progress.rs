use serde::{Deserialize, Serialize};

/// Wire shape of `GET /progress`. Computed server side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub xp: u32,
    pub level: u32,
    pub xp_to_next_level: u32,
    pub total_questions: u32,
    pub correct_answers: u32,
    pub accuracy_percent: f64,
    pub current_streak: u32,
    pub best_streak: u32,
    pub achievements: Vec<String>,
}

impl ProgressResponse {
    /// Fill ratio of the XP bar, 0..=100.
    pub fn xp_progress_percent(&self) -> f64 {
        let span = self.xp + self.xp_to_next_level;
        if span == 0 {
            return 0.0;
        }
        (f64::from(self.xp) * 100.0 / f64::from(span)).clamp(0.0, 100.0)
    }
}
