//! Overview (job counts by status and recently published artifacts)
//! Queue (pending jobs in claim order, jobs being processed)
//! Failed (jobs waiting for a resubmission)

use std::{
  io,
  sync::mpsc,
  time::{Duration, Instant},
};

use anyhow::Result;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use sqlx::{Pool, Postgres};
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};
use vtqs::{
  config::Config,
  database::setup_database,
  models::{JobRecord, JobStatus, TranscodeArtifact},
};

const REFRESH: Duration = Duration::from_secs(2);
const LIST_LIMIT: i64 = 20;

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Queue,
  Failed,
}

#[derive(Default)]
struct Snapshot {
  pending: i64,
  processing: i64,
  failed: i64,
  artifacts: i64,
  recent: Vec<TranscodeArtifact>,
  queue: Vec<JobRecord>,
  failed_jobs: Vec<JobRecord>,
  error: Option<String>,
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      snapshot: Snapshot::default(),
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Failed,
      DashboardTab::Failed => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Failed,
      DashboardTab::Queue => DashboardTab::Overview,
      DashboardTab::Failed => DashboardTab::Queue,
    }
  }
}

async fn fetch_snapshot(pool: &Pool<Postgres>) -> Result<Snapshot, sqlx::Error> {
  let mut snapshot = Snapshot::default();

  let counts = sqlx::query_as::<_, (String, i64)>(
    "SELECT status, COUNT(*) FROM video_processing_jobs GROUP BY status",
  )
    .fetch_all(pool)
    .await?;
  for (status, count) in counts {
    match JobStatus::try_from(status) {
      Ok(JobStatus::Pending) => snapshot.pending = count,
      Ok(JobStatus::Processing) => snapshot.processing = count,
      Ok(JobStatus::Failed) => snapshot.failed = count,
      Err(_) => {}
    }
  }

  snapshot.artifacts = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM video_artifacts")
    .fetch_one(pool)
    .await?;

  snapshot.recent = sqlx::query_as::<_, TranscodeArtifact>(
    "SELECT id, node_id, object_storage_key, size_bytes, last_accessed_at, metadata
     FROM video_artifacts
     ORDER BY last_accessed_at DESC
     LIMIT $1",
  )
    .bind(LIST_LIMIT)
    .fetch_all(pool)
    .await?;

  // Processing first, then pending in the order the scheduler will claim them.
  snapshot.queue = sqlx::query_as::<_, JobRecord>(
    "SELECT node_id, status, created_at, accessed_at
     FROM video_processing_jobs
     WHERE status IN ('pending', 'processing')
     ORDER BY status = 'pending', accessed_at, created_at
     LIMIT $1",
  )
    .bind(LIST_LIMIT)
    .fetch_all(pool)
    .await?;

  snapshot.failed_jobs = sqlx::query_as::<_, JobRecord>(
    "SELECT node_id, status, created_at, accessed_at
     FROM video_processing_jobs
     WHERE status = 'failed'
     ORDER BY accessed_at DESC
     LIMIT $1",
  )
    .bind(LIST_LIMIT)
    .fetch_all(pool)
    .await?;

  Ok(snapshot)
}

fn main() -> Result<()> {
  dotenvy::dotenv().ok();
  let config = Config::from_env()?;
  let rt = tokio::runtime::Runtime::new()?;
  let db_pool = rt.block_on(setup_database(&config.database_url))?;

  let (tx, rx) = mpsc::channel::<Snapshot>();
  rt.spawn(async move {
    loop {
      let snapshot = fetch_snapshot(&db_pool).await.unwrap_or_else(|e| Snapshot {
        error: Some(e.to_string()),
        ..Snapshot::default()
      });
      if tx.send(snapshot).is_err() {
        break;
      }
      tokio::time::sleep(REFRESH).await;
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let result = run_app(&mut terminal, &rx);

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  result
}

fn run_app<B: Backend>(terminal: &mut Terminal<B>, rx: &mpsc::Receiver<Snapshot>) -> Result<()> {
  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Some(snapshot) = rx.try_iter().last() {
      app.snapshot = snapshot;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => return Ok(()),
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = ["Overview", "Queue", "Failed"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("Transcode Ledger"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Overview => 0,
      DashboardTab::Queue => 1,
      DashboardTab::Failed => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, &app.snapshot, chunks[1]),
    DashboardTab::Queue => render_jobs(f, &app.snapshot.queue, "Queue (processing, then next to claim)", chunks[1]),
    DashboardTab::Failed => render_jobs(f, &app.snapshot.failed_jobs, "Failed Jobs", chunks[1]),
  }

  let footer_text = match &app.snapshot.error {
    Some(e) => format!("Database error: {e}"),
    None => "←/→: Switch Tabs | q: Quit".into(),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, snapshot: &Snapshot, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(35), Constraint::Percentage(65)].as_ref())
    .split(area);

  let counts = [
    ("Pending", snapshot.pending, Color::Yellow),
    ("Processing", snapshot.processing, Color::Cyan),
    ("Failed", snapshot.failed, Color::Red),
    ("Artifacts", snapshot.artifacts, Color::Green),
  ];
  let count_items: Vec<ListItem> = counts
    .iter()
    .map(|(label, count, color)| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{label:<12}"), Style::default().fg(*color).add_modifier(Modifier::BOLD)),
        Span::raw(count.to_string()),
      ]))
    })
    .collect();
  let counts_list = List::new(count_items)
    .block(Block::default().borders(Borders::ALL).title("Jobs"));
  f.render_widget(counts_list, chunks[0]);

  let artifact_items: Vec<ListItem> = snapshot.recent.iter().map(|a| {
    let meta = &a.metadata.0;
    ListItem::new(vec![
      Spans::from(Span::styled(format!("Node: {}", a.node_id), Style::default().add_modifier(Modifier::BOLD))),
      Spans::from(Span::raw(format!(
        "{}x{} {} | {:.1}s | audio: {}",
        meta.width, meta.height, meta.codec, meta.duration_seconds, meta.has_audio
      ))),
      Spans::from(Span::raw(format!("Key: {} | {}", a.storage_key, a.last_accessed_at.format("%Y-%m-%d %H:%M:%S")))),
    ])
  }).collect();
  let artifacts_list = List::new(if artifact_items.is_empty() {
    vec![ListItem::new(Spans::from(Span::raw("No artifacts yet")))]
  } else {
    artifact_items
  })
    .block(Block::default().borders(Borders::ALL).title("Recent Artifacts"));
  f.render_widget(artifacts_list, chunks[1]);
}

fn render_jobs<B: Backend>(f: &mut tui::Frame<B>, jobs: &[JobRecord], title: &str, area: Rect) {
  let job_items: Vec<ListItem> = jobs.iter().map(|j| {
    let color = match j.status {
      JobStatus::Pending => Color::Yellow,
      JobStatus::Processing => Color::Cyan,
      JobStatus::Failed => Color::Red,
    };
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{} ", j.node_id), Style::default().fg(color).add_modifier(Modifier::BOLD)),
      Span::raw(format!(
        "Status: {} | Created: {} | Accessed: {}",
        j.status.as_str(),
        j.created_at.format("%Y-%m-%d %H:%M:%S"),
        j.accessed_at.format("%Y-%m-%d %H:%M:%S"),
      )),
    ]))
  }).collect();
  let jobs_list = List::new(job_items)
    .block(Block::default().borders(Borders::ALL).title(title));
  f.render_widget(jobs_list, area);
}
