//! Live sensor table for hrv-sonar.
//!
//! Usage:
//!   cargo run --bin tui               # real Bluetooth
//!   cargo run --bin tui -- --simulate # built-in virtual sensors (no hardware needed)
//!
//! Keys
//! ----
//!   ↑ / ↓    select a sensor (its HRV series is charted below the table)
//!   q / Esc  quit
//!
//! The TUI only observes: it reads the repository's live view and the
//! scheduler's countdown, and never drives the lifecycle itself.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Sparkline, Table, TableState},
    Frame, Terminal,
};
use tokio::sync::{oneshot, watch};

use hrv_sonar::controller::LifecycleController;
use hrv_sonar::repository::{PeripheralRepository, PeripheralView, RepositoryConfig};
use hrv_sonar::sensor_client::{ClientConfig, SensorClient};
use hrv_sonar::simulator::{self, SimulatorConfig};
use hrv_sonar::types::{ConnectionState, PeripheralRecord, UltrasonicStatus};
use hrv_sonar::ultrasonic::{PacedSink, UltrasonicScheduler, CYCLE_BUDGET, SAMPLE_RATE};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Braille spinner frames shown while nothing is tracked yet.
const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Most recent HRV samples drawn in the sparkline.
const SPARK_WINDOW: usize = 120;

// ── App state ─────────────────────────────────────────────────────────────────

struct App {
    simulated: bool,
    view: PeripheralView,
    /// Addresses in display order, rebuilt on every refresh.
    rows: Vec<String>,
    table: TableState,
    countdown: i32,
}

impl App {
    fn new(simulated: bool) -> Self {
        Self {
            simulated,
            view: PeripheralView::default(),
            rows: Vec::new(),
            table: TableState::default(),
            countdown: -1,
        }
    }

    /// Take a fresh snapshot, keeping the selection on the same address.
    fn refresh(&mut self, view: PeripheralView, countdown: i32) {
        let selected = self
            .table
            .selected()
            .and_then(|i| self.rows.get(i))
            .cloned();

        let mut rows: Vec<String> = view.keys().cloned().collect();
        rows.sort();
        let index = match selected {
            Some(address) => rows.iter().position(|a| *a == address),
            None => None,
        }
        .or(if rows.is_empty() { None } else { Some(0) });

        self.table.select(index);
        self.rows = rows;
        self.view = view;
        self.countdown = countdown;
    }

    fn selected_record(&self) -> Option<&PeripheralRecord> {
        let address = self.rows.get(self.table.selected()?)?;
        self.view.get(address)
    }

    fn select_next(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let i = self.table.selected().map_or(0, |i| (i + 1) % self.rows.len());
        self.table.select(Some(i));
    }

    fn select_previous(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let n = self.rows.len();
        let i = self.table.selected().map_or(0, |i| (i + n - 1) % n);
        self.table.select(Some(i));
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn draw(frame: &mut Frame, app: &mut App) {
    let root = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(6),
        Constraint::Length(8),
        Constraint::Length(3),
    ])
    .split(frame.area());

    draw_header(frame, root[0], app);
    draw_table(frame, root[1], app);
    draw_hrv(frame, root[2], app);
    draw_footer(frame, root[3]);
}

fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let source = if app.simulated {
        Span::styled("◆ Simulated", Style::default().fg(Color::Cyan))
    } else {
        Span::styled("● Bluetooth", Style::default().fg(Color::Green))
    };

    let tracked = if app.view.is_empty() {
        Span::styled(
            format!("{} Waiting for sensors…", spinner_str()),
            Style::default().fg(Color::Yellow),
        )
    } else {
        let waiting = app
            .view
            .values()
            .filter(|r| r.ultrasonic == UltrasonicStatus::Unknown)
            .count();
        Span::styled(
            format!("{} tracked, {waiting} awaiting pattern", app.view.len()),
            Style::default().fg(Color::White),
        )
    };

    let pattern = if app.countdown >= 0 {
        Span::styled(
            format!("♪ Playing {}/{CYCLE_BUDGET}", app.countdown),
            Style::default()
                .fg(Color::Magenta)
                .add_modifier(Modifier::BOLD),
        )
    } else {
        Span::styled("♪ Idle", Style::default().fg(Color::DarkGray))
    };

    let line = Line::from(vec![
        Span::styled(
            " HRV Sonar ",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        sep(),
        source,
        sep(),
        tracked,
        sep(),
        pattern,
    ]);
    frame.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn sep<'a>() -> Span<'a> {
    Span::styled(" │ ", Style::default().fg(Color::DarkGray))
}

fn state_style(state: ConnectionState) -> Style {
    match state {
        ConnectionState::Connected => Style::default().fg(Color::Green),
        ConnectionState::Connecting => Style::default().fg(Color::Yellow),
        ConnectionState::Disconnecting => Style::default().fg(Color::Red),
        ConnectionState::Discovered => Style::default().fg(Color::Gray),
    }
}

fn ultrasonic_cell(status: UltrasonicStatus) -> Cell<'static> {
    match status {
        UltrasonicStatus::Unknown => Cell::from("…").style(Style::default().fg(Color::Yellow)),
        UltrasonicStatus::Detected => {
            Cell::from("heard").style(Style::default().fg(Color::Green))
        }
        UltrasonicStatus::NotDetected => {
            Cell::from("missed").style(Style::default().fg(Color::Red))
        }
    }
}

fn draw_table(frame: &mut Frame, area: Rect, app: &mut App) {
    let header = Row::new(vec![
        "Address", "Name", "ID", "State", "RSSI", "Dist", "Pattern", "HRV n", "Last",
    ])
    .style(
        Style::default()
            .fg(Color::LightBlue)
            .add_modifier(Modifier::BOLD),
    );

    let rows: Vec<Row> = app
        .rows
        .iter()
        .filter_map(|address| app.view.get(address))
        .map(|r| {
            Row::new(vec![
                Cell::from(r.address.clone()),
                Cell::from(r.name.clone().unwrap_or_else(|| "?".into())),
                Cell::from(
                    r.persistent_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".into()),
                ),
                Cell::from(format!("{:?}", r.connection_state))
                    .style(state_style(r.connection_state)),
                Cell::from(format!("{} dBm", r.advertisement.rssi)),
                Cell::from(format!("{:.2} m", r.advertisement.distance_m)),
                ultrasonic_cell(r.ultrasonic),
                Cell::from(r.hrv.sample_count().to_string()),
                Cell::from(
                    r.hrv
                        .last_value()
                        .map(|v| format!("{v:.0} ms"))
                        .unwrap_or_else(|| "-".into()),
                ),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(18),
        Constraint::Length(10),
        Constraint::Length(7),
        Constraint::Length(14),
        Constraint::Length(9),
        Constraint::Length(9),
        Constraint::Length(8),
        Constraint::Length(6),
        Constraint::Min(7),
    ];

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(" Sensors "))
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("▶ ");
    frame.render_stateful_widget(table, area, &mut app.table);
}

fn draw_hrv(frame: &mut Frame, area: Rect, app: &App) {
    let Some(record) = app.selected_record() else {
        frame.render_widget(
            Paragraph::new(" No sensor selected.")
                .style(Style::default().fg(Color::DarkGray))
                .block(Block::default().borders(Borders::ALL).title(" HRV ")),
            area,
        );
        return;
    };

    let samples = record.hrv.samples();
    let start = samples.len().saturating_sub(SPARK_WINDOW);
    let data: Vec<u64> = samples[start..]
        .iter()
        .map(|s| s.value.max(0.0).round() as u64)
        .collect();

    let title = format!(
        " HRV {} ({} sample{}) ",
        record.name.as_deref().unwrap_or(&record.address),
        samples.len(),
        if samples.len() == 1 { "" } else { "s" }
    );
    frame.render_widget(
        Sparkline::default()
            .block(Block::default().borders(Borders::ALL).title(title))
            .data(&data)
            .style(Style::default().fg(Color::Cyan)),
        area,
    );
}

fn draw_footer(frame: &mut Frame, area: Rect) {
    let key = |s: &'static str| {
        Span::styled(
            s,
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
    };
    let line = Line::from(vec![
        Span::raw(" "),
        key("[↑↓]"),
        Span::raw("Select  "),
        key("[q]"),
        Span::raw("Quit"),
    ]);
    frame.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use std::io::IsTerminal as _;
    if !io::stdout().is_terminal() {
        eprintln!("Error: hrv-sonar tui requires a real terminal (TTY).");
        eprintln!("Run it directly in a terminal emulator, not piped or redirected.");
        std::process::exit(1);
    }

    // ── Logging ─────────────────────────────────────────────────────────────
    // Logs go to hrv-sonar-tui.log so they never interfere with the display.
    //   RUST_LOG=debug cargo run --bin tui
    {
        use std::fs::File;
        if let Ok(file) = File::create("hrv-sonar-tui.log") {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
    }

    let simulate = std::env::args().any(|a| a == "--simulate");

    // ── Core ──────────────────────────────────────────────────────────────────
    let scheduler = Arc::new(UltrasonicScheduler::new(Arc::new(PacedSink::new(
        SAMPLE_RATE,
    ))));
    let repository = Arc::new(PeripheralRepository::new(
        Arc::clone(&scheduler),
        RepositoryConfig::default(),
    ));
    let mut view_rx: watch::Receiver<PeripheralView> = repository.subscribe();

    let link = if simulate {
        simulator::spawn(SimulatorConfig::default())
    } else {
        SensorClient::new(ClientConfig::default()).open().await?
    };

    let (quit_tx, quit_rx) = oneshot::channel::<()>();
    let mut controller = LifecycleController::new(link.commands, Arc::clone(&repository));
    let driver = tokio::spawn(async move {
        controller
            .run(link.events, async {
                let _ = quit_rx.await;
            })
            .await;
    });

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let tick = Duration::from_millis(100);

    let mut app = App::new(simulate);

    // ── Main loop ─────────────────────────────────────────────────────────────
    loop {
        let view = view_rx.borrow_and_update().clone();
        app.refresh(view, scheduler.countdown());
        terminal.draw(|f| draw(f, &mut app))?;

        if !event::poll(tick)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        // Raw mode delivers Ctrl+C as a key, not SIGINT.
        let ctrl_c =
            key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c');
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            _ if ctrl_c => break,
            KeyCode::Down => app.select_next(),
            KeyCode::Up => app.select_previous(),
            _ => {}
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    let _ = quit_tx.send(());
    if tokio::time::timeout(Duration::from_secs(2), driver).await.is_err() {
        log::warn!("controller did not finish within 2 s");
    }
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
