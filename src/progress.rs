use crate::protocol::FileDescriptor;

/// Segments in a rendered bar.
pub const BAR_WIDTH: usize = 25;

/// Renders the progress bar for `file` after `chunks_sent` chunks of
/// `buffer_size` bytes. Returns the bar and its count of filled segments.
/// Empty files render as complete.
pub fn render(
    chunks_sent: u64,
    bar_width: usize,
    file: &FileDescriptor,
    buffer_size: usize,
) -> (String, usize) {
    let sent = (chunks_sent as u128 * buffer_size as u128).min(file.size as u128);
    let (filled, percent) = if file.size == 0 {
        (bar_width, 100)
    } else {
        let total = file.size as u128;
        (
            (sent * bar_width as u128 / total) as usize,
            (sent * 100 / total) as usize,
        )
    };

    let bar = format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        " ".repeat(bar_width - filled),
        percent
    );
    (bar, filled)
}
