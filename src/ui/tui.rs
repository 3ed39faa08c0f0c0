use crate::ui::app::ChatApp;
use anyhow::Result;
use crossterm::{
    event::{
        self, DisableFocusChange, DisableMouseCapture, EnableFocusChange, EnableMouseCapture, Event, KeyEvent, KeyEventKind,
        MouseEvent,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io::{self, Stderr};
use tokio::sync::mpsc;

pub type Tui = Terminal<CrosstermBackend<Stderr>>;

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(300);

/// Terminal input and timer events
#[derive(Debug)]
pub enum AppEvent {
    Key(KeyEvent),
    Mouse(MouseEvent),
    Resize(u16, u16),
    /// Terminal window gained (`true`) or lost focus
    Focus(bool),
    Tick,
}

pub struct EventHandler {
    rx: mpsc::UnboundedReceiver<AppEvent>,
}

impl EventHandler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let tx_events = tx.clone();
        tokio::spawn(async move {
            let mut reader = event::EventStream::new();
            while let Some(evt) = reader.next().await {
                let app_event = match evt {
                    // Only key presses, not releases
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => Some(AppEvent::Key(key)),
                    Ok(Event::Mouse(mouse)) => Some(AppEvent::Mouse(mouse)),
                    Ok(Event::Resize(w, h)) => Some(AppEvent::Resize(w, h)),
                    Ok(Event::FocusGained) => Some(AppEvent::Focus(true)),
                    Ok(Event::FocusLost) => Some(AppEvent::Focus(false)),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::error!(error = %e, "terminal event stream failed");
                        break;
                    }
                };

                if let Some(event) = app_event {
                    if tx_events.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        // Redraws the busy indicator and session status
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                if tx.send(AppEvent::Tick).is_err() {
                    break;
                }
            }
        });

        Self { rx }
    }

    pub async fn next(&mut self) -> Option<AppEvent> {
        self.rx.recv().await
    }
}

pub fn init() -> Result<Tui> {
    enable_raw_mode()?;
    execute!(io::stderr(), EnterAlternateScreen, EnableMouseCapture, EnableFocusChange)?;

    let backend = CrosstermBackend::new(io::stderr());
    let terminal = Terminal::new(backend)?;

    Ok(terminal)
}

pub fn restore() -> Result<()> {
    execute!(io::stderr(), DisableFocusChange, DisableMouseCapture, LeaveAlternateScreen)?;
    disable_raw_mode()?;
    Ok(())
}

/// Install panic hook to restore terminal on panic
pub fn install_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = restore();
        original_hook(panic_info);
    }));
}

/// Run the chat screen until the user quits
pub async fn run(mut app: ChatApp) -> Result<()> {
    install_panic_hook();
    let mut terminal = init()?;
    let result = event_loop(&mut terminal, &mut app).await;
    restore()?;
    terminal.show_cursor()?;
    result
}

async fn event_loop(terminal: &mut Tui, app: &mut ChatApp) -> Result<()> {
    let mut events = EventHandler::new();
    let mut messages = app.coordinator().store().subscribe();
    let mut busy = app.coordinator().subscribe_busy();

    app.sync_messages(messages.borrow_and_update().clone());
    app.set_busy(*busy.borrow_and_update());

    loop {
        terminal.draw(|frame| {
            let area = frame.size();
            app.render(area, frame.buffer_mut());
        })?;

        if app.should_quit() {
            return Ok(());
        }

        tokio::select! {
            event = events.next() => match event {
                Some(event) => app.handle_event(event),
                None => return Ok(()),
            },
            Ok(()) = messages.changed() => {
                let snapshot = messages.borrow_and_update().clone();
                app.sync_messages(snapshot);
            }
            Ok(()) = busy.changed() => {
                let value = *busy.borrow_and_update();
                app.set_busy(value);
            }
        }
    }
}
