pub mod emojis {
    pub const SWORDS: &str = "⚔️  ";
    pub const SPARKLES: &str = "✨ ";
    pub const HOURGLASS: &str = "⏳ ";
    pub const CROSS: &str = "❌ ";
    pub const LINE_CLEAR: &str = "\x1b[2K\r";
}

pub fn timing(duration_seconds: f64, no_timing: bool) -> String {
    if no_timing {
        String::new()
    } else {
        format!(" in {duration_seconds:.2}s")
    }
}
