mod activity;
mod api;
mod asset_cache;
mod chat;
mod config;
mod error;
mod models;
mod render;
mod session;
mod tasks;
mod upload;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use iced::{
    widget::{
        button, column, container, image, pick_list, progress_bar, row, scrollable, text,
        text_input, Column, Space,
    },
    Element, Length, Task, Theme, Font, Subscription,
    time, clipboard,
    keyboard::{self, Key},
    event::{self, Event as IcedEvent},
    alignment, Padding,
    window,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use activity::Kind;
use api::ApiClient;
use asset_cache::{AssetCache, AssetRequest};
use chat::StreamUpdate;
use config::Config;
use error::ClientError;
use models::{ChatDetail, ChatSummary, ProblemReport, ServerConfig, StatsResponse};
use render::Segment;
use session::{AppState, ChatMessage, Role, StreamEffect};
use upload::{ProgressView, UploadCoordinator, UploadEvent, UploadFile, UploadLimits};

const LOGO_PATH: &str = "/static/img/icon-192.png";
const SIDEBAR_WIDTH: f32 = 290.0;
const TITLE_WIDTH: usize = 28;
const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn main() -> anyhow::Result<()> {
    let config = Config::load();
    init_tracing(&config.logging.level);

    let api = Arc::new(ApiClient::new(
        &config.server.base_url,
        Duration::from_secs(config.server.connect_timeout_secs),
    )?);
    tracing::info!(server = %api.base_url(), "starting document assistant");

    let window_settings = window::Settings {
        size: iced::Size::new(config.window.width as f32, config.window.height as f32),
        min_size: Some(iced::Size::new(
            config.window.min_width as f32,
            config.window.min_height as f32,
        )),
        position: window::Position::Centered,
        ..Default::default()
    };

    iced::application("Document Assistant", App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window_settings)
        .default_font(Font::MONOSPACE)
        .run_with(move || App::new(config, api))?;

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,doc_assistant={},activity={}", level, level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn pick_document() -> Option<PathBuf> {
    rfd::AsyncFileDialog::new()
        .set_title("Upload a document")
        .pick_file()
        .await
        .map(|f| f.path().to_path_buf())
}

async fn pick_screenshot() -> Option<PathBuf> {
    rfd::AsyncFileDialog::new()
        .set_title("Attach a screenshot")
        .add_filter("Images", &["png", "jpg", "jpeg", "gif", "webp"])
        .pick_file()
        .await
        .map(|f| f.path().to_path_buf())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Panel {
    Chat,
    Settings,
    Report,
}

/// Destructive actions wait for an explicit yes.
#[derive(Debug, Clone, PartialEq)]
enum Confirm {
    DeleteSource(String),
    DeleteChat(String),
    ResetDb,
}

impl Confirm {
    fn prompt(&self) -> String {
        match self {
            Confirm::DeleteSource(name) => format!("Delete \"{}\" and all of its paragraphs?", name),
            Confirm::DeleteChat(_) => "Delete this chat?".to_string(),
            Confirm::ResetDb => "Reset the database? All documents will be removed.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingsField {
    Kind,
    Endpoint,
    Temperature,
    MaxTokens,
    LogLevel,
}

#[derive(Debug, Clone, Default)]
struct SettingsForm {
    kind: String,
    name: String,
    endpoint: String,
    temperature: String,
    max_tokens: String,
    log_level: String,
    models: Vec<String>,
}

impl SettingsForm {
    fn fill(&mut self, config: &ServerConfig) {
        self.kind = config.model.kind.clone();
        self.name = config.model.name.clone();
        self.endpoint = config.model.endpoint.clone();
        self.temperature = config.model.temperature.to_string();
        self.max_tokens = config.model.max_tokens.to_string();
        self.log_level = config.logging.level.clone();
    }

    /// Apply the edited fields on top of the loaded server settings.
    fn apply_to(&self, config: &mut ServerConfig) -> Result<(), String> {
        let temperature = self
            .temperature
            .trim()
            .parse::<f64>()
            .map_err(|_| "Temperature must be a number.".to_string())?;
        let max_tokens = self
            .max_tokens
            .trim()
            .parse::<u64>()
            .map_err(|_| "Max tokens must be a whole number.".to_string())?;

        config.model.kind = self.kind.trim().to_string();
        config.model.name = self.name.trim().to_string();
        config.model.endpoint = self.endpoint.trim().to_string();
        config.model.temperature = temperature;
        config.model.max_tokens = max_tokens;
        config.logging.level = self.log_level.trim().to_uppercase();
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct ReportForm {
    message_id: Option<String>,
    content: String,
    image: Option<PathBuf>,
}

struct UploadPanel {
    seq: u64,
    file_name: String,
    progress: ProgressView,
}

#[derive(Debug, Clone)]
enum Message {
    InputChanged(String),
    Submit,
    Stop,
    Stream(u64, StreamUpdate),
    CopyMessage(usize),
    RerunMessage(usize),
    ToggleThought(usize, usize),

    StatsLoaded(Result<StatsResponse, String>),
    ToggleSource(String),
    ClearSelection,
    TogglePublic(String, bool),
    SourceUpdated(Result<String, String>),
    SourceDeleted(String, Result<String, String>),
    DatabaseReset(Result<String, String>),

    ChatsLoaded(Result<Vec<ChatSummary>, String>),
    NewChat,
    OpenChat(String),
    ChatLoaded(Result<ChatDetail, String>),
    ChatDeleted(String, Result<(), String>),

    Ask(Confirm),
    Confirmed,
    Cancelled,

    PickFile,
    FileChosen(Option<PathBuf>),
    FileReady(Result<UploadFile, String>),
    Upload(UploadEvent),
    HideProgress(u64),

    OpenSettings,
    SettingsLoaded(Result<ServerConfig, String>),
    ModelsLoaded(Result<Vec<String>, String>),
    RefreshModels,
    ModelSelected(String),
    SettingChanged(SettingsField, String),
    SaveSettings,
    SettingsSaved(Result<(ServerConfig, String), String>),

    OpenReport(Option<String>),
    ReportChanged(String),
    PickReportImage,
    ReportImageChosen(Option<PathBuf>),
    SubmitReport,
    ReportSent(Result<String, String>),

    LogoLoaded(Result<Vec<u8>, String>),
    ClosePanel,
    Tick,
}

struct App {
    config: Config,
    api: Arc<ApiClient>,
    uploads: UploadCoordinator<ApiClient>,
    state: AppState,
    input_text: String,
    input_id: text_input::Id,
    transcript_id: scrollable::Id,
    abort: Option<CancellationToken>,
    upload: Option<UploadPanel>,
    upload_seq: u64,
    /// Thought blocks whose open state was flipped by the user.
    toggled_thoughts: HashSet<(usize, usize)>,
    confirm: Option<Confirm>,
    panel: Panel,
    settings: SettingsForm,
    report: ReportForm,
    logo: Option<image::Handle>,
    loading_frame: usize,
}

impl App {
    fn new(config: Config, api: Arc<ApiClient>) -> (Self, Task<Message>) {
        let limits = UploadLimits {
            max_bytes: config.max_upload_bytes(),
            bypass_size_check: config.server_is_trusted(),
            poll_interval: config.poll_interval(),
            cleanup_grace: config.cleanup_grace(),
        };
        let uploads = UploadCoordinator::new(api.clone(), limits);

        let assets = match AssetCache::open(&config.cache_db_path(), &config.cache.name) {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(error = %e, "asset cache unavailable");
                None
            }
        };

        let input_id = text_input::Id::unique();

        let app = App {
            config,
            api,
            uploads,
            state: AppState::new(),
            input_text: String::new(),
            input_id: input_id.clone(),
            transcript_id: scrollable::Id::unique(),
            abort: None,
            upload: None,
            upload_seq: 0,
            toggled_thoughts: HashSet::new(),
            confirm: None,
            panel: Panel::Chat,
            settings: SettingsForm::default(),
            report: ReportForm::default(),
            logo: None,
            loading_frame: 0,
        };

        let mut startup = vec![
            text_input::focus(input_id),
            app.refresh_stats(),
            app.refresh_chats(),
        ];
        if let Some(cache) = assets {
            startup.push(app.warm_assets(cache));
        }

        (app, Task::batch(startup))
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::InputChanged(value) => {
                self.input_text = value;
                Task::none()
            }
            Message::Submit => {
                let query = self.input_text.clone();
                self.start_ask(query)
            }
            Message::Stop => {
                if let Some(token) = self.abort.take() {
                    token.cancel();
                }
                Task::none()
            }
            Message::Stream(generation, update) => {
                match self.state.apply_stream_update(generation, update) {
                    StreamEffect::Stale => Task::none(),
                    StreamEffect::Updated => self.scroll_to_end(),
                    StreamEffect::Settled => {
                        self.abort = None;
                        self.scroll_to_end()
                    }
                    StreamEffect::RefreshHistory => {
                        self.abort = None;
                        Task::batch([self.refresh_chats(), self.scroll_to_end()])
                    }
                }
            }
            Message::CopyMessage(idx) => match self.state.transcript.get(idx) {
                Some(message) if message.role == Role::User => {
                    self.input_text = session::strip_filter_suffix(&message.text).to_string();
                    text_input::focus(self.input_id.clone())
                }
                Some(message) => {
                    activity::log_with(Kind::Info, "Copied to clipboard");
                    clipboard::write(message.text.clone())
                }
                None => Task::none(),
            },
            Message::RerunMessage(idx) => {
                let query = match self.state.transcript.get(idx) {
                    Some(message) => session::strip_filter_suffix(&message.text).to_string(),
                    None => return Task::none(),
                };
                self.start_ask(query)
            }
            Message::ToggleThought(msg_idx, seg_idx) => {
                let key = (msg_idx, seg_idx);
                if !self.toggled_thoughts.remove(&key) {
                    self.toggled_thoughts.insert(key);
                }
                Task::none()
            }

            Message::StatsLoaded(Ok(stats)) => {
                self.state.apply_stats(stats);
                Task::none()
            }
            Message::StatsLoaded(Err(e)) => {
                activity::log_with(Kind::Error, format!("Could not load sources: {}", e));
                Task::none()
            }
            Message::ToggleSource(name) => {
                self.state.toggle_source(&name);
                Task::none()
            }
            Message::ClearSelection => {
                self.state.clear_selection();
                Task::none()
            }
            Message::TogglePublic(name, is_public) => {
                let api = self.api.clone();
                Task::perform(
                    async move {
                        api.toggle_public(&name, is_public)
                            .await
                            .map_err(|e| e.user_message())
                    },
                    Message::SourceUpdated,
                )
            }
            Message::SourceUpdated(result) => {
                self.log_result(Kind::Sources, result);
                self.refresh_stats()
            }
            Message::SourceDeleted(name, result) => {
                if result.is_ok() {
                    self.state.source_deleted(&name);
                }
                self.log_result(Kind::Sources, result);
                self.refresh_stats()
            }
            Message::DatabaseReset(result) => {
                if result.is_ok() {
                    self.state.clear_selection();
                    self.state.sources.clear();
                }
                self.log_result(Kind::Sources, result);
                self.refresh_stats()
            }

            Message::ChatsLoaded(Ok(chats)) => {
                self.state.set_chats(chats);
                Task::none()
            }
            Message::ChatsLoaded(Err(e)) => {
                activity::log_with(Kind::Error, format!("Could not load history: {}", e));
                Task::none()
            }
            Message::NewChat => {
                self.cancel_stream();
                self.state.start_new_chat();
                self.toggled_thoughts.clear();
                self.panel = Panel::Chat;
                activity::log_with(Kind::Chat, "Started a new chat");
                text_input::focus(self.input_id.clone())
            }
            Message::OpenChat(id) => {
                let api = self.api.clone();
                Task::perform(
                    async move { api.chat(&id).await.map_err(|e| e.user_message()) },
                    Message::ChatLoaded,
                )
            }
            Message::ChatLoaded(Ok(detail)) => {
                self.cancel_stream();
                self.state.load_chat(detail);
                self.toggled_thoughts.clear();
                self.panel = Panel::Chat;
                self.scroll_to_end()
            }
            Message::ChatLoaded(Err(e)) => {
                activity::log_with(Kind::Error, format!("Could not open chat: {}", e));
                Task::none()
            }
            Message::ChatDeleted(id, Ok(())) => {
                if self.state.chat_deleted(&id) {
                    self.cancel_stream();
                    self.toggled_thoughts.clear();
                }
                activity::log_with(Kind::Chat, "Chat deleted");
                self.refresh_chats()
            }
            Message::ChatDeleted(_, Err(e)) => {
                activity::log_with(Kind::Error, format!("Could not delete chat: {}", e));
                Task::none()
            }

            Message::Ask(confirm) => {
                self.confirm = Some(confirm);
                Task::none()
            }
            Message::Cancelled => {
                self.confirm = None;
                Task::none()
            }
            Message::Confirmed => match self.confirm.take() {
                Some(action) => self.run_confirmed(action),
                None => Task::none(),
            },

            Message::PickFile => {
                if self.uploads.is_busy() {
                    return Task::none();
                }
                Task::perform(pick_document(), Message::FileChosen)
            }
            Message::FileChosen(Some(path)) => Task::perform(
                async move { UploadFile::from_path(&path).await.map_err(|e| e.to_string()) },
                Message::FileReady,
            ),
            Message::FileChosen(None) => Task::none(),
            Message::FileReady(Ok(file)) => self.start_upload(file),
            Message::FileReady(Err(e)) => {
                activity::log_with(Kind::Error, format!("Could not read file: {}", e));
                Task::none()
            }
            Message::Upload(event) => self.apply_upload_event(event),
            Message::HideProgress(seq) => {
                if self.upload.as_ref().map(|u| u.seq) == Some(seq) {
                    self.upload = None;
                }
                Task::none()
            }

            Message::OpenSettings => {
                self.panel = Panel::Settings;
                let api = self.api.clone();
                Task::batch([
                    Task::perform(
                        async move { api.server_config().await.map_err(|e| e.user_message()) },
                        Message::SettingsLoaded,
                    ),
                    self.refresh_models(),
                ])
            }
            Message::SettingsLoaded(Ok(config)) => {
                self.settings.fill(&config);
                self.state.server_config = Some(config);
                Task::none()
            }
            Message::SettingsLoaded(Err(e)) => {
                activity::log_with(Kind::Error, format!("Could not load settings: {}", e));
                Task::none()
            }
            Message::RefreshModels => self.refresh_models(),
            Message::ModelsLoaded(Ok(models)) => {
                activity::log_with(Kind::Info, format!("{} models available", models.len()));
                self.settings.models = models;
                Task::none()
            }
            Message::ModelsLoaded(Err(e)) => {
                activity::log_with(Kind::Error, format!("Could not load models: {}", e));
                Task::none()
            }
            Message::ModelSelected(name) => {
                self.settings.name = name;
                Task::none()
            }
            Message::SettingChanged(field, value) => {
                let slot = match field {
                    SettingsField::Kind => &mut self.settings.kind,
                    SettingsField::Endpoint => &mut self.settings.endpoint,
                    SettingsField::Temperature => &mut self.settings.temperature,
                    SettingsField::MaxTokens => &mut self.settings.max_tokens,
                    SettingsField::LogLevel => &mut self.settings.log_level,
                };
                *slot = value;
                Task::none()
            }
            Message::SaveSettings => {
                let Some(mut config) = self.state.server_config.clone() else {
                    activity::log_with(Kind::Error, "Settings have not loaded yet.");
                    return Task::none();
                };
                if let Err(e) = self.settings.apply_to(&mut config) {
                    activity::log_with(Kind::Error, e);
                    return Task::none();
                }
                let api = self.api.clone();
                Task::perform(
                    async move {
                        match api.save_server_config(&config).await {
                            Ok(message) => Ok((config, message)),
                            Err(e) => Err(e.user_message()),
                        }
                    },
                    Message::SettingsSaved,
                )
            }
            Message::SettingsSaved(Ok((config, message))) => {
                self.state.server_config = Some(config);
                let message = if message.is_empty() { "Settings saved".to_string() } else { message };
                activity::log_with(Kind::Info, message);
                self.panel = Panel::Chat;
                Task::none()
            }
            Message::SettingsSaved(Err(e)) => {
                activity::log_with(Kind::Error, format!("Could not save settings: {}", e));
                Task::none()
            }

            Message::OpenReport(message_id) => {
                self.report = ReportForm { message_id, ..Default::default() };
                self.panel = Panel::Report;
                Task::none()
            }
            Message::ReportChanged(value) => {
                self.report.content = value;
                Task::none()
            }
            Message::PickReportImage => Task::perform(pick_screenshot(), Message::ReportImageChosen),
            Message::ReportImageChosen(image) => {
                if image.is_some() {
                    self.report.image = image;
                }
                Task::none()
            }
            Message::SubmitReport => {
                if self.report.content.trim().is_empty() {
                    activity::log_with(Kind::Error, "Describe the problem before sending.");
                    return Task::none();
                }
                let report = ProblemReport {
                    content: self.report.content.trim().to_string(),
                    message_id: self.report.message_id.clone(),
                    image: self.report.image.clone(),
                };
                let api = self.api.clone();
                Task::perform(
                    async move { api.report(&report).await.map_err(|e| e.user_message()) },
                    Message::ReportSent,
                )
            }
            Message::ReportSent(result) => {
                if result.is_ok() {
                    self.report = ReportForm::default();
                    self.panel = Panel::Chat;
                }
                self.log_result(Kind::Info, result.map(|m| {
                    if m.is_empty() { "Report sent, thank you.".to_string() } else { m }
                }));
                Task::none()
            }

            Message::LogoLoaded(Ok(bytes)) => {
                self.logo = Some(image::Handle::from_bytes(bytes));
                Task::none()
            }
            Message::LogoLoaded(Err(e)) => {
                tracing::debug!(error = %e, "no logo");
                Task::none()
            }
            Message::ClosePanel => {
                self.confirm = None;
                self.panel = Panel::Chat;
                Task::none()
            }
            Message::Tick => {
                self.loading_frame = (self.loading_frame + 1) % 80;
                Task::none()
            }
        }
    }

    fn start_ask(&mut self, query: String) -> Task<Message> {
        if self.state.is_streaming() {
            return Task::none();
        }
        let Some(ticket) = self.state.begin_ask(&query) else {
            return Task::none();
        };
        self.input_text.clear();
        self.panel = Panel::Chat;

        let token = CancellationToken::new();
        self.abort = Some(token.clone());
        let api = self.api.clone();
        let generation = ticket.generation;
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = async move {
            chat::ask(&api, &ticket.request, &token, |update| {
                let _ = tx.send(update);
            })
            .await;
        };

        Task::batch([
            Task::run(tasks::with_events(driver, rx), move |update| {
                Message::Stream(generation, update)
            }),
            self.scroll_to_end(),
        ])
    }

    fn cancel_stream(&mut self) {
        if let Some(token) = self.abort.take() {
            token.cancel();
        }
    }

    fn start_upload(&mut self, file: UploadFile) -> Task<Message> {
        if self.uploads.is_busy() {
            activity::log_with(Kind::Upload, "An upload is already in progress.");
            return Task::none();
        }
        let uploads = self.uploads.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = async move {
            if let Err(ClientError::Busy) = uploads.submit(file, tx).await {
                activity::log_with(Kind::Upload, "An upload is already in progress.");
            }
        };

        Task::run(tasks::with_events(driver, rx), Message::Upload)
    }

    fn apply_upload_event(&mut self, event: UploadEvent) -> Task<Message> {
        match event {
            UploadEvent::Started { job_id, file_name } => {
                self.upload_seq += 1;
                activity::log_with(Kind::Upload, format!("Uploading {} ({})", file_name, job_id));
                self.upload = Some(UploadPanel {
                    seq: self.upload_seq,
                    file_name,
                    progress: upload::merge_progress(Some(0), None, None),
                });
                Task::none()
            }
            UploadEvent::Progress(view) => {
                if let Some(panel) = self.upload.as_mut() {
                    panel.progress = view;
                }
                Task::none()
            }
            UploadEvent::Succeeded(message) => {
                activity::log_with(Kind::Upload, message.clone());
                self.state.push_notice(format!("✅ {}", message));
                Task::batch([self.refresh_stats(), self.scroll_to_end()])
            }
            UploadEvent::Failed(message) => {
                activity::log_with(Kind::Error, message.clone());
                self.state.push_notice(format!("❌ {}", message));
                self.scroll_to_end()
            }
            UploadEvent::Released => {
                let seq = self.upload_seq;
                Task::perform(tokio::time::sleep(self.config.cleanup_grace()), move |_| {
                    Message::HideProgress(seq)
                })
            }
        }
    }

    fn run_confirmed(&mut self, action: Confirm) -> Task<Message> {
        let api = self.api.clone();
        match action {
            Confirm::DeleteSource(name) => Task::perform(
                async move {
                    let result = api.delete_source(&name).await.map_err(|e| e.user_message());
                    (name, result)
                },
                |(name, result)| Message::SourceDeleted(name, result),
            ),
            Confirm::DeleteChat(id) => Task::perform(
                async move {
                    let result = api.delete_chat(&id).await.map_err(|e| e.user_message());
                    (id, result)
                },
                |(id, result)| Message::ChatDeleted(id, result),
            ),
            Confirm::ResetDb => Task::perform(
                async move { api.reset_db().await.map_err(|e| e.user_message()) },
                Message::DatabaseReset,
            ),
        }
    }

    fn log_result(&self, kind: Kind, result: Result<String, String>) {
        match result {
            Ok(message) if !message.is_empty() => activity::log_with(kind, message),
            Ok(_) => {}
            Err(e) => activity::log_with(Kind::Error, e),
        }
    }

    fn refresh_stats(&self) -> Task<Message> {
        let api = self.api.clone();
        Task::perform(
            async move { api.stats().await.map_err(|e| e.user_message()) },
            Message::StatsLoaded,
        )
    }

    fn refresh_chats(&self) -> Task<Message> {
        let api = self.api.clone();
        Task::perform(
            async move { api.chats().await.map_err(|e| e.user_message()) },
            Message::ChatsLoaded,
        )
    }

    fn refresh_models(&self) -> Task<Message> {
        let api = self.api.clone();
        Task::perform(
            async move { api.available_models().await.map_err(|e| e.user_message()) },
            Message::ModelsLoaded,
        )
    }

    /// Precache the shell assets, drop old cache generations and load the logo.
    fn warm_assets(&self, cache: AssetCache) -> Task<Message> {
        let api = self.api.clone();
        let precache = self.config.cache.precache.clone();
        Task::perform(
            async move {
                if let Err(e) = cache.install(api.as_ref(), &precache).await {
                    tracing::warn!(cache = %cache.name(), error = %e, "precache failed");
                }
                if let Err(e) = cache.activate().await {
                    tracing::warn!(error = %e, "could not evict old caches");
                }
                cache
                    .fetch(api.as_ref(), &AssetRequest::asset(LOGO_PATH))
                    .await
                    .map_err(|e| e.to_string())
            },
            Message::LogoLoaded,
        )
    }

    fn scroll_to_end(&self) -> Task<Message> {
        scrollable::snap_to(self.transcript_id.clone(), scrollable::RelativeOffset::END)
    }

    fn subscription(&self) -> Subscription<Message> {
        let busy = self.state.is_streaming() || self.upload.is_some();
        let timer = if busy {
            time::every(Duration::from_millis(80)).map(|_| Message::Tick)
        } else {
            Subscription::none()
        };

        let events = event::listen_with(|event, _status, _id| match event {
            IcedEvent::Keyboard(keyboard::Event::KeyPressed {
                key: Key::Named(keyboard::key::Named::Escape),
                ..
            }) => Some(Message::ClosePanel),
            IcedEvent::Window(window::Event::FileDropped(path)) => {
                Some(Message::FileChosen(Some(path)))
            }
            _ => None,
        });

        Subscription::batch([timer, events])
    }

    fn view(&self) -> Element<'_, Message> {
        let main: Element<Message> = match self.panel {
            Panel::Chat => self.chat_view(),
            Panel::Settings => self.settings_view(),
            Panel::Report => self.report_view(),
        };

        let mut main_column = Column::new().spacing(10).padding(10);
        if let Some(confirm) = &self.confirm {
            main_column = main_column.push(self.confirm_bar(confirm));
        }
        main_column = main_column.push(main);

        let sidebar = container(scrollable(self.sidebar()).height(Length::Fill))
            .width(Length::Fixed(SIDEBAR_WIDTH))
            .height(Length::Fill)
            .padding(10)
            .style(container::rounded_box);

        container(row![sidebar, main_column.width(Length::Fill)].spacing(5))
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn sidebar(&self) -> Element<'_, Message> {
        let mut header = row![].spacing(10).align_y(alignment::Vertical::Center);
        if let Some(logo) = &self.logo {
            header = header.push(image(logo.clone()).width(36).height(36));
        }
        header = header.push(text("Document Assistant").size(18));

        let upload_button = button(text("Upload document").size(14))
            .on_press_maybe((!self.uploads.is_busy()).then_some(Message::PickFile))
            .width(Length::Fill)
            .padding(8);

        let mut col = column![
            header,
            upload_button,
            text("or drop a file onto the window").size(12).style(text::secondary),
        ]
        .spacing(8);

        if let Some(upload) = &self.upload {
            let status = upload.progress.status.clone().unwrap_or_else(|| format!("{}%", upload.progress.percent));
            let spinner = SPINNER[self.loading_frame % SPINNER.len()];
            col = col.push(
                column![
                    text(render::truncate_title(&upload.file_name, TITLE_WIDTH)).size(13),
                    progress_bar(0.0..=100.0, upload.progress.percent as f32).height(8),
                    text(format!("{} {}", spinner, status)).size(12),
                ]
                .spacing(4),
            );
        }

        col = col.push(Space::with_height(6));
        let count = match self.state.document_count {
            Some(n) => format!("Sources ({} paragraphs)", n),
            None => "Sources".to_string(),
        };
        let mut sources_header = row![text(count).size(15), Space::with_width(Length::Fill)]
            .align_y(alignment::Vertical::Center);
        if !self.state.selected_sources.is_empty() {
            sources_header = sources_header.push(
                button(text("Clear").size(12)).on_press(Message::ClearSelection).style(button::text),
            );
        }
        col = col.push(sources_header);

        if !self.state.selected_sources.is_empty() {
            col = col.push(
                text(format!("Filtering by {} source(s)", self.state.selected_sources.len()))
                    .size(12)
                    .style(text::success),
            );
        }

        if self.state.sources.is_empty() {
            col = col.push(text("No documents yet").size(12).style(text::secondary));
        }
        for source in &self.state.sources {
            let selected = self.state.is_selected(&source.name);
            let label = button(text(render::truncate_title(&source.name, TITLE_WIDTH - 6)).size(13))
                .on_press(Message::ToggleSource(source.name.clone()))
                .style(if selected { button::primary } else { button::secondary })
                .width(Length::Fill);

            let mut line = row![label].spacing(4).align_y(alignment::Vertical::Center);
            if source.is_owner {
                let visibility = if source.is_public { "public" } else { "private" };
                line = line
                    .push(
                        button(text(visibility).size(11))
                            .on_press(Message::TogglePublic(source.name.clone(), !source.is_public))
                            .style(button::text),
                    )
                    .push(
                        button(text("✕").size(11))
                            .on_press(Message::Ask(Confirm::DeleteSource(source.name.clone())))
                            .style(button::danger),
                    );
            } else {
                line = line.push(text("shared").size(11).style(text::secondary));
            }
            col = col.push(line);
        }

        col = col.push(
            button(text("Reset database").size(12))
                .on_press(Message::Ask(Confirm::ResetDb))
                .style(button::danger),
        );

        col = col.push(Space::with_height(6));
        col = col.push(
            row![
                text("History").size(15),
                Space::with_width(Length::Fill),
                button(text("New chat").size(12)).on_press(Message::NewChat),
            ]
            .align_y(alignment::Vertical::Center),
        );
        for summary in &self.state.chats {
            let current = self.state.current_chat_id.as_deref() == Some(summary.id.as_str());
            let title = if summary.title.trim().is_empty() { "Untitled chat" } else { summary.title.as_str() };
            col = col.push(
                row![
                    button(text(render::truncate_title(title, TITLE_WIDTH - 4)).size(13))
                        .on_press(Message::OpenChat(summary.id.clone()))
                        .style(if current { button::primary } else { button::text })
                        .width(Length::Fill),
                    button(text("✕").size(11))
                        .on_press(Message::Ask(Confirm::DeleteChat(summary.id.clone())))
                        .style(button::text),
                ]
                .align_y(alignment::Vertical::Center),
            );
        }

        col = col.push(Space::with_height(6));
        col = col.push(
            row![
                button(text("Settings").size(12)).on_press(Message::OpenSettings),
                button(text("Report a problem").size(12)).on_press(Message::OpenReport(None)),
            ]
            .spacing(6),
        );

        if let Some(entry) = activity::latest() {
            let line = text(entry.text).size(12);
            col = col.push(match entry.kind {
                Kind::Error => line.style(text::danger),
                _ => line.style(text::secondary),
            });
        }

        col.into()
    }

    fn confirm_bar(&self, confirm: &Confirm) -> Element<'_, Message> {
        container(
            row![
                text(confirm.prompt()).size(14),
                Space::with_width(Length::Fill),
                button(text("Yes").size(13)).on_press(Message::Confirmed).style(button::danger),
                button(text("No").size(13)).on_press(Message::Cancelled).style(button::secondary),
            ]
            .spacing(8)
            .align_y(alignment::Vertical::Center),
        )
        .padding(10)
        .width(Length::Fill)
        .style(container::bordered_box)
        .into()
    }

    fn chat_view(&self) -> Element<'_, Message> {
        let messages = Column::with_children(
            self.state
                .transcript
                .iter()
                .enumerate()
                .map(|(idx, message)| self.message_view(idx, message)),
        )
        .spacing(12)
        .padding(Padding::from([5, 15]));

        let transcript = scrollable(messages)
            .id(self.transcript_id.clone())
            .height(Length::Fill)
            .width(Length::Fill);

        let input = text_input("Ask about your documents...", &self.input_text)
            .on_input(Message::InputChanged)
            .on_submit(Message::Submit)
            .padding(12)
            .size(16)
            .id(self.input_id.clone());

        let action = if self.state.is_streaming() {
            button(text("Stop").size(14)).on_press(Message::Stop).style(button::danger)
        } else {
            button(text("Send").size(14)).on_press(Message::Submit)
        };

        column![
            transcript,
            row![input, action.padding(12)].spacing(8).align_y(alignment::Vertical::Center),
        ]
        .spacing(10)
        .height(Length::Fill)
        .into()
    }

    fn message_view<'a>(&'a self, idx: usize, message: &'a ChatMessage) -> Element<'a, Message> {
        let body: Element<Message> = match message.role {
            Role::User => column![
                text(message.text.as_str()).size(15),
                row![
                    button(text("Copy").size(11)).on_press(Message::CopyMessage(idx)).style(button::text),
                    button(text("Re-run").size(11))
                        .on_press_maybe((!self.state.is_streaming()).then_some(Message::RerunMessage(idx)))
                        .style(button::text),
                ]
                .spacing(4),
            ]
            .spacing(4)
            .align_x(alignment::Horizontal::Right)
            .into(),
            Role::Bot if message.pending => {
                let spinner = SPINNER[self.loading_frame % SPINNER.len()];
                text(format!("{} {}", spinner, message.text)).size(15).style(text::secondary).into()
            }
            Role::Bot => self.answer_view(idx, message),
        };

        let bubble = container(body).padding(10).max_width(760);
        let bubble = match message.role {
            Role::User => bubble.style(container::bordered_box),
            Role::Bot => bubble.style(container::rounded_box),
        };

        let align = match message.role {
            Role::User => alignment::Horizontal::Right,
            Role::Bot => alignment::Horizontal::Left,
        };
        container(bubble).width(Length::Fill).align_x(align).into()
    }

    fn answer_view<'a>(&'a self, idx: usize, message: &'a ChatMessage) -> Element<'a, Message> {
        let rendered = render::render_message(&message.text, &message.reference_details);
        let mut col = Column::new().spacing(6);

        for (seg_idx, segment) in rendered.segments.into_iter().enumerate() {
            match segment {
                Segment::Text(body) => col = col.push(text(body).size(15)),
                Segment::Thought { content, in_progress } => {
                    let open = in_progress != self.toggled_thoughts.contains(&(idx, seg_idx));
                    let label = match (open, in_progress) {
                        (true, true) => "▾ Thinking...",
                        (true, false) => "▾ Thought process",
                        (false, true) => "▸ Thinking...",
                        (false, false) => "▸ Thought process",
                    };
                    col = col.push(
                        button(text(label).size(12))
                            .on_press(Message::ToggleThought(idx, seg_idx))
                            .style(button::text)
                            .padding(2),
                    );
                    if open {
                        col = col.push(
                            container(text(content).size(13).style(text::secondary))
                                .padding(Padding::from([4, 12])),
                        );
                    }
                }
            }
        }

        for reference in rendered.references {
            col = col.push(
                column![
                    text(reference.label).size(12).style(text::primary),
                    text(reference.content).size(12).style(text::secondary),
                ]
                .spacing(2),
            );
        }

        let mut footer = row![].spacing(4).align_y(alignment::Vertical::Center);
        if let Some(stats) = &message.stats {
            footer = footer.push(text(render::stats_line(stats)).size(11).style(text::secondary));
            footer = footer.push(Space::with_width(8));
        }
        footer = footer.push(
            button(text("Copy").size(11)).on_press(Message::CopyMessage(idx)).style(button::text),
        );
        if message.id.is_some() {
            footer = footer.push(
                button(text("Report").size(11))
                    .on_press(Message::OpenReport(message.id.clone()))
                    .style(button::text),
            );
        }

        col.push(footer).into()
    }

    fn settings_view(&self) -> Element<'_, Message> {
        let form = &self.settings;
        let field = |label: &'static str, value: &str, which: SettingsField| {
            column![
                text(label).size(13),
                text_input(label, value)
                    .on_input(move |v| Message::SettingChanged(which, v))
                    .padding(8),
            ]
            .spacing(4)
        };

        let model_picker = row![
            pick_list(form.models.as_slice(), Some(form.name.clone()), Message::ModelSelected)
                .placeholder("Select a model")
                .width(Length::Fill),
            button(text("Refresh").size(13)).on_press(Message::RefreshModels),
        ]
        .spacing(8)
        .align_y(alignment::Vertical::Center);

        let loaded = self.state.server_config.is_some();
        let body = column![
            text("Server settings").size(20),
            field("Model type", &form.kind, SettingsField::Kind),
            column![text("Model").size(13), model_picker].spacing(4),
            field("Endpoint", &form.endpoint, SettingsField::Endpoint),
            field("Temperature", &form.temperature, SettingsField::Temperature),
            field("Max tokens", &form.max_tokens, SettingsField::MaxTokens),
            field("Server log level", &form.log_level, SettingsField::LogLevel),
            row![
                button(text("Save").size(14)).on_press_maybe(loaded.then_some(Message::SaveSettings)),
                button(text("Close").size(14)).on_press(Message::ClosePanel).style(button::secondary),
            ]
            .spacing(8),
        ]
        .spacing(12)
        .max_width(560);

        scrollable(container(body).padding(15)).height(Length::Fill).into()
    }

    fn report_view(&self) -> Element<'_, Message> {
        let report = &self.report;
        let about = match &report.message_id {
            Some(id) => format!("About answer {}", id),
            None => "General problem".to_string(),
        };
        let attachment = match &report.image {
            Some(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
            None => "No screenshot attached".to_string(),
        };

        let body = column![
            text("Report a problem").size(20),
            text(about).size(13).style(text::secondary),
            text_input("What went wrong?", &report.content)
                .on_input(Message::ReportChanged)
                .on_submit(Message::SubmitReport)
                .padding(10),
            row![
                button(text("Attach screenshot").size(13)).on_press(Message::PickReportImage),
                text(attachment).size(12),
            ]
            .spacing(8)
            .align_y(alignment::Vertical::Center),
            row![
                button(text("Send").size(14)).on_press(Message::SubmitReport),
                button(text("Cancel").size(14)).on_press(Message::ClosePanel).style(button::secondary),
            ]
            .spacing(8),
        ]
        .spacing(12)
        .max_width(560);

        container(body).padding(15).height(Length::Fill).into()
    }

    fn theme(&self) -> Theme {
        Theme::TokyoNight
    }
}
