//! Terminal emulator abstraction wrapping [`alacritty_terminal`].
//!
//! [`AlacrittyParser`] is a thin wrapper around `Term` and `Processor`
//! presenting a simple `process(bytes)` / `resize(rows, cols)` interface.
//! The PTY bridge (`pty::mod`) does not need a full emulator on the hot
//! path — the kernel pty already does line-discipline work — but the
//! spy feature (spec §3, "Spy") needs a way to hand a freshly attached
//! observer a correct redraw of whatever is currently on screen instead
//! of just the bytes written from that point forward. [`generate_ansi_snapshot`]
//! does that by serializing the terminal grid directly to ANSI bytes.
//!
//! # Thread Safety
//!
//! `AlacrittyParser<L>` is `Send` when `L: Send`; shared access should
//! use `Arc<Mutex<AlacrittyParser<L>>>`.

use alacritty_terminal::event::EventListener;
use alacritty_terminal::grid::{Dimensions, Grid};
use alacritty_terminal::index::{Column, Line, Point};
use alacritty_terminal::term::cell::{Cell, Flags};
use alacritty_terminal::term::{Config, Term, TermMode};
use alacritty_terminal::vte::ansi::{Color, NamedColor, Processor};

/// Scrollback retained for the spy snapshot buffer.
pub const DEFAULT_SCROLLBACK_LINES: usize = 2_000;

const MIN_ROWS: u16 = 1;
const MIN_COLS: u16 = 1;

#[derive(Debug, Clone, Copy)]
struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl Dimensions for TermSize {
    fn columns(&self) -> usize {
        self.columns
    }
    fn screen_lines(&self) -> usize {
        self.screen_lines
    }
    fn total_lines(&self) -> usize {
        self.screen_lines
    }
}

/// No-op event listener — title/bell events are not consumed server-side.
#[derive(Debug, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {
    fn send_event(&self, _event: alacritty_terminal::event::Event) {}
}

/// Thin wrapper around `Term<L>` + `Processor` used to track the grid
/// contents of a node's PTY output so a spy observer attaching mid-session
/// can be handed a redraw rather than a blank screen.
pub struct AlacrittyParser<L: EventListener> {
    term: Term<L>,
    processor: Processor,
}

impl<L: EventListener> std::fmt::Debug for AlacrittyParser<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlacrittyParser")
            .field("history_size", &self.history_size())
            .field("cols", &self.term.grid().columns())
            .field("rows", &self.term.grid().screen_lines())
            .finish_non_exhaustive()
    }
}

impl AlacrittyParser<NoopListener> {
    pub fn new_noop(rows: u16, cols: u16, scrollback: usize) -> Self {
        Self::new_with_listener(rows, cols, scrollback, NoopListener)
    }
}

impl<L: EventListener> AlacrittyParser<L> {
    pub fn new_with_listener(rows: u16, cols: u16, scrollback: usize, listener: L) -> Self {
        let rows = (rows.max(MIN_ROWS)) as usize;
        let cols = (cols.max(MIN_COLS)) as usize;
        let size = TermSize { columns: cols, screen_lines: rows };
        let config = Config { scrolling_history: scrollback, ..Config::default() };
        let term = Term::new(config, &size, listener);
        let processor = Processor::new();
        Self { term, processor }
    }

    /// Feed raw PTY output bytes into the terminal emulator.
    pub fn process(&mut self, data: &[u8]) {
        self.processor.advance(&mut self.term, data);
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        let rows = (rows.max(MIN_ROWS)) as usize;
        let cols = (cols.max(MIN_COLS)) as usize;
        let size = TermSize { columns: cols, screen_lines: rows };
        self.term.resize(size);
    }

    pub fn term(&self) -> &Term<L> {
        &self.term
    }

    pub fn history_size(&self) -> usize {
        self.term.grid().history_size()
    }

    pub fn cursor_hidden(&self) -> bool {
        !self.term.mode().contains(TermMode::SHOW_CURSOR)
    }
}

/// Generate a clean ANSI snapshot of the current grid, for a spy
/// observer attaching mid-session.
pub fn generate_ansi_snapshot<L: EventListener>(parser: &AlacrittyParser<L>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"\x1b[0m\x1b[H");

    let term = parser.term();
    let grid = term.grid();
    let cols = grid.columns();
    let screen_lines = grid.screen_lines();

    for line_idx in 0..screen_lines {
        emit_grid_line(&mut out, grid, Line(line_idx as i32), cols);
        if line_idx < screen_lines - 1 {
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b"\x1b[0m");
    let cursor = grid.cursor.point;
    let row = cursor.line.0 as usize + 1;
    let col = cursor.column.0 + 1;
    out.extend_from_slice(format!("\x1b[{row};{col}H").as_bytes());
    out
}

fn emit_grid_line(out: &mut Vec<u8>, grid: &Grid<Cell>, line: Line, cols: usize) {
    let mut sgr = SgrState::reset();
    let mut char_buf = [0u8; 4];

    for col in 0..cols {
        let cell = &grid[Point::new(line, Column(col))];
        if cell.flags.contains(Flags::WIDE_CHAR_SPACER) {
            continue;
        }
        let new_sgr = SgrState::from_cell(cell);
        if new_sgr != sgr {
            new_sgr.emit_diff(out);
            sgr = new_sgr;
        }
        let encoded = cell.c.encode_utf8(&mut char_buf);
        out.extend_from_slice(encoded.as_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SgrState {
    fg: Color,
    bg: Color,
    flags: Flags,
}

impl SgrState {
    fn reset() -> Self {
        Self {
            fg: Color::Named(NamedColor::Foreground),
            bg: Color::Named(NamedColor::Background),
            flags: Flags::empty(),
        }
    }

    fn from_cell(cell: &Cell) -> Self {
        const VISUAL_FLAGS: Flags = Flags::BOLD
            .union(Flags::ITALIC)
            .union(Flags::UNDERLINE)
            .union(Flags::DIM)
            .union(Flags::INVERSE)
            .union(Flags::HIDDEN)
            .union(Flags::STRIKEOUT);
        Self {
            fg: cell.fg,
            bg: cell.bg,
            flags: cell.flags.intersection(VISUAL_FLAGS),
        }
    }

    fn emit_diff(self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"\x1b[0");
        if self.flags.contains(Flags::BOLD) {
            out.extend_from_slice(b";1");
        }
        if self.flags.contains(Flags::DIM) {
            out.extend_from_slice(b";2");
        }
        if self.flags.contains(Flags::ITALIC) {
            out.extend_from_slice(b";3");
        }
        if self.flags.contains(Flags::UNDERLINE) {
            out.extend_from_slice(b";4");
        }
        if self.flags.contains(Flags::INVERSE) {
            out.extend_from_slice(b";7");
        }
        if self.flags.contains(Flags::HIDDEN) {
            out.extend_from_slice(b";8");
        }
        if self.flags.contains(Flags::STRIKEOUT) {
            out.extend_from_slice(b";9");
        }
        if let Color::Named(name) = self.fg {
            if let Some(code) = named_fg_sgr(name) {
                out.push(b';');
                out.extend_from_slice(code.as_bytes());
            }
        }
        out.push(b'm');
    }
}

fn named_fg_sgr(color: NamedColor) -> Option<&'static str> {
    match color {
        NamedColor::Black => Some("30"),
        NamedColor::Red => Some("31"),
        NamedColor::Green => Some("32"),
        NamedColor::Yellow => Some("33"),
        NamedColor::Blue => Some("34"),
        NamedColor::Magenta => Some("35"),
        NamedColor::Cyan => Some("36"),
        NamedColor::White => Some("37"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_noop_creates_parser() {
        let p = AlacrittyParser::new_noop(24, 80, 100);
        assert_eq!(p.term().grid().screen_lines(), 24);
        assert_eq!(p.term().grid().columns(), 80);
    }

    #[test]
    fn process_basic_text() {
        let mut p = AlacrittyParser::new_noop(24, 80, 100);
        p.process(b"Hello");
        let cell = p.term().grid()[Point::new(Line(0), Column(0))].clone();
        assert_eq!(cell.c, 'H');
    }

    #[test]
    fn generate_snapshot_contains_reset_preamble() {
        let p = AlacrittyParser::new_noop(24, 80, 100);
        let snap = generate_ansi_snapshot(&p);
        assert!(snap.starts_with(b"\x1b[0m\x1b[H"));
    }

    #[test]
    fn min_rows_cols_clamped() {
        let p = AlacrittyParser::new_noop(0, 0, 100);
        assert_eq!(p.term().grid().screen_lines(), MIN_ROWS as usize);
        assert_eq!(p.term().grid().columns(), MIN_COLS as usize);
    }
}
