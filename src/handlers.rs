use crate::db::{self, Pool};
use crate::format::{alias_map, escape_html, format_schedule};
use crate::groups::{resolve_group_name, GroupLookupError};
use crate::model::{monday_of, IngestionState, Lesson, Student};
use crate::normalize::normalize_group;
use crate::update::Updater;
use anyhow::Result;
use chrono::Local;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Shared state handed to every update.
#[derive(Clone)]
pub struct BotState {
    pub pool: Pool,
    pub updater: Arc<Updater>,
    pub admin_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Ping,
    Group(String),
    Rasp(Option<String>),
    Bells,
    Notify,
    Codes,
    Alias(String),
    Unalias(String),
    Update,
    Stats,
    Unknown,
}

/// Recognise a command, a Russian alias of one, or a menu button.
/// Plain text that is none of these yields `None`.
pub fn parse_command(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    match trimmed {
        "📅 Расписание" => return Some(Command::Rasp(None)),
        "🔔 Звонки" => return Some(Command::Bells),
        _ => {}
    }

    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    let slash = head.starts_with('/');
    let word = head
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    let command = match (slash, word.as_str()) {
        (true, "start") => Command::Start,
        (true, "ping") => Command::Ping,
        (true, "group") | (_, "группа") => Command::Group(rest.to_string()),
        (true, "rasp") | (_, "рп") | (_, "расписание") => Command::Rasp(arg),
        (true, "bells") | (_, "звонки") => Command::Bells,
        (true, "notify") => Command::Notify,
        (true, "codes") => Command::Codes,
        (true, "alias") | (_, "алиас") => Command::Alias(rest.to_string()),
        (true, "unalias") => Command::Unalias(rest.to_string()),
        (true, "update") => Command::Update,
        (true, "stats") => Command::Stats,
        (true, _) => Command::Unknown,
        (false, _) => return None,
    };
    Some(command)
}

/// What `/alias <args>` asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasRequest {
    List,
    Remove(String),
    Set { original: String, alias: String },
    Malformed,
    TooShort,
}

pub fn parse_alias_args(args: &str) -> AliasRequest {
    let args = args.trim();
    if args.is_empty() {
        return AliasRequest::List;
    }
    if let Some(name) = args
        .strip_prefix("remove ")
        .or_else(|| args.strip_prefix("Remove "))
    {
        return AliasRequest::Remove(name.trim().to_string());
    }
    let Some((original, alias)) = args.split_once('=') else {
        return AliasRequest::Malformed;
    };
    let (original, alias) = (original.trim(), alias.trim());
    if original.chars().count() < 2 || alias.chars().count() < 2 {
        return AliasRequest::TooShort;
    }
    AliasRequest::Set {
        original: original.to_string(),
        alias: alias.to_string(),
    }
}

const WELCOME: &str = "👋 Привет! Я бот с расписанием колледжа.\n\n\
Для начала работы мне нужно знать твою группу.\n\
Напиши команду:\n<code>/group [твоя_группа]</code>\n\n\
Например: <code>/group И-255</code> или <code>/group 255</code>\n\n\
Расписание: /rasp, звонки: /bells.\n\
Уведомления: /notify, коды предметов: /codes, замены названий: /alias.\n\
Расписание другой группы: <code>/rasp И-255</code>.";

const GROUP_USAGE: &str = "✍️ <b>Введите команду:</b>\n<code>/group [имя/номер]</code>\n\n\
Например: <code>/group 255</code> или <code>/group И-255</code>";

const NO_GROUP: &str = "⚠️ Группа не выбрана. Используй <code>/group [номер]</code>";

const NO_BELLS: &str =
    "⚠️ Информация о звонках пока не загружена.\nПопробуйте позже (после обновления файла).";

const ALIAS_USAGE: &str = "📝 У вас нет алиасов.\n\
Использование: <code>/alias Старое Имя = Новое Имя</code>\n\
Пример: <code>/alias Математика = Матеша</code>";

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, state: &BotState, msg: &Message) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(command) = parse_command(text) else {
        return Ok(());
    };

    let user_id = user.id.0 as i64;
    let chat = msg.chat.id;
    debug!(user_id, ?command, "command received");
    let pool = &state.pool;

    match command {
        Command::Start => {
            db::upsert_student(pool, user_id, chat.0, Some(user.first_name.as_str())).await?;
            reply(bot, chat, WELCOME).await;
        }
        Command::Ping => {
            let _ = bot.send_message(chat, "PONG").await;
        }
        Command::Group(arg) => {
            if arg.trim().is_empty() {
                reply(bot, chat, GROUP_USAGE).await;
                return Ok(());
            }
            let known = db::distinct_group_names(pool).await?;
            match resolve_group_name(&arg, &known) {
                Ok(group) => {
                    db::upsert_student(pool, user_id, chat.0, Some(user.first_name.as_str())).await?;
                    db::set_selected_group(pool, user_id, Some(&group)).await?;
                    info!(user_id, %group, "group selected");
                    reply(
                        bot,
                        chat,
                        &format!(
                            "✅ Группа <b>{}</b> сохранена! Теперь жми /rasp",
                            escape_html(&group)
                        ),
                    )
                    .await;
                }
                Err(err) => reply(bot, chat, &format!("⚠️ {}", escape_html(&err.to_string()))).await,
            }
        }
        Command::Rasp(arg) => {
            let student = db::upsert_student(pool, user_id, chat.0, Some(user.first_name.as_str())).await?;
            show_schedule(bot, state, chat, &student, arg.as_deref()).await?;
        }
        Command::Bells => {
            let ingestion = db::fetch_ingestion_state(pool).await?;
            if ingestion.last_bell_schedule.trim().is_empty() {
                reply(bot, chat, NO_BELLS).await;
            } else {
                reply(
                    bot,
                    chat,
                    &format!("🔔 <b>Расписание звонков:</b>\n\n{}", ingestion.last_bell_schedule),
                )
                .await;
            }
        }
        Command::Notify => {
            let student = db::upsert_student(pool, user_id, chat.0, Some(user.first_name.as_str())).await?;
            let enabled = !student.notifications_enabled;
            db::set_notifications(pool, user_id, enabled).await?;
            let text = if enabled {
                "🔔 Уведомления включены."
            } else {
                "🔕 Уведомления выключены."
            };
            reply(bot, chat, text).await;
        }
        Command::Codes => {
            let student = db::upsert_student(pool, user_id, chat.0, Some(user.first_name.as_str())).await?;
            let enabled = !student.show_codes;
            db::set_show_codes(pool, user_id, enabled).await?;
            let text = if enabled {
                "🔢 Коды предметов показываются."
            } else {
                "🔢 Коды предметов скрыты."
            };
            reply(bot, chat, text).await;
        }
        Command::Alias(args) => {
            db::upsert_student(pool, user_id, chat.0, Some(user.first_name.as_str())).await?;
            handle_alias(bot, pool, chat, user_id, parse_alias_args(&args)).await?;
        }
        Command::Unalias(name) => {
            handle_alias(bot, pool, chat, user_id, AliasRequest::Remove(name)).await?;
        }
        Command::Update => {
            if state.admin_id != Some(user_id) {
                reply(bot, chat, "⛔ Команда доступна только администратору.").await;
                return Ok(());
            }
            info!(user_id, "manual update requested");
            run_with_status(bot, chat, &state.updater, "⏳ Запуск обновления...", true).await?;
        }
        Command::Stats => {
            let users = db::list_students(pool).await?.len();
            let groups = db::distinct_group_names(pool).await?.len();
            let lessons = db::count_lessons(pool).await?;
            let ingestion = db::fetch_ingestion_state(pool).await?;
            reply(bot, chat, &stats_message(users, groups, lessons, &ingestion)).await;
        }
        Command::Unknown => {
            let _ = bot
                .send_message(chat, "Неизвестная команда. Список команд: /start")
                .await;
        }
    }
    Ok(())
}

async fn reply(bot: &Bot, chat: ChatId, text: &str) {
    if let Err(err) = bot
        .send_message(chat, text)
        .parse_mode(ParseMode::Html)
        .await
    {
        warn!(?err, "failed to reply");
    }
}

/// Group to show for `/rasp [arg]`; `Err` carries the reply for the user.
fn target_group(
    arg: Option<&str>,
    student: &Student,
    known: &[String],
) -> Result<String, String> {
    match arg {
        Some(arg) => match resolve_group_name(arg, known) {
            Ok(group) => Ok(group),
            Err(GroupLookupError::NotFound) => Ok(normalize_group(arg)),
            Err(err) => Err(format!("⚠️ {}", escape_html(&err.to_string()))),
        },
        None => student
            .selected_group
            .clone()
            .ok_or_else(|| NO_GROUP.to_string()),
    }
}

async fn show_schedule(
    bot: &Bot,
    state: &BotState,
    chat: ChatId,
    student: &Student,
    arg: Option<&str>,
) -> Result<()> {
    let pool = &state.pool;
    let known = db::distinct_group_names(pool).await?;
    let mut group = match target_group(arg, student, &known) {
        Ok(group) => group,
        Err(text) => {
            reply(bot, chat, &text).await;
            return Ok(());
        }
    };

    let mut lessons = db::fetch_lessons_by_group(pool, &group).await?;
    if lessons.is_empty() && !known.is_empty() {
        if let Ok(resolved) = resolve_group_name(&group, &known) {
            if resolved != group {
                lessons = db::fetch_lessons_by_group(pool, &resolved).await?;
                if arg.is_none() {
                    db::set_selected_group(pool, student.user_id, Some(&resolved)).await?;
                }
                group = resolved;
            }
        }
    }

    if lessons.is_empty() {
        let intro = format!(
            "⏳ Нет данных для <b>{}</b>. Проверяю обновление...",
            escape_html(&group)
        );
        run_with_status(bot, chat, &state.updater, &intro, false).await?;

        let known = db::distinct_group_names(pool).await?;
        let Ok(refreshed) = resolve_group_name(&group, &known) else {
            reply(bot, chat, "❌ Группа не найдена.").await;
            return Ok(());
        };
        lessons = db::fetch_lessons_by_group(pool, &refreshed).await?;
        if lessons.is_empty() {
            reply(bot, chat, "❌ Расписание не найдено даже в новом файле.").await;
            return Ok(());
        }
        group = refreshed;
    }

    send_schedule(bot, pool, chat, student, &group, &lessons).await
}

async fn send_schedule(
    bot: &Bot,
    pool: &Pool,
    chat: ChatId,
    student: &Student,
    group: &str,
    lessons: &[Lesson],
) -> Result<()> {
    let aliases = alias_map(&db::list_aliases_by_user(pool, student.user_id).await?);
    let week_start = db::fetch_ingestion_state(pool)
        .await?
        .week_start
        .unwrap_or_else(|| monday_of(Local::now().date_naive()));
    let text = format_schedule(group, lessons, &aliases, student.show_codes, week_start);
    reply(bot, chat, &text).await;
    Ok(())
}

async fn handle_alias(
    bot: &Bot,
    pool: &Pool,
    chat: ChatId,
    user_id: i64,
    request: AliasRequest,
) -> Result<()> {
    match request {
        AliasRequest::List => {
            let aliases = db::list_aliases_by_user(pool, user_id).await?;
            if aliases.is_empty() {
                reply(bot, chat, ALIAS_USAGE).await;
                return Ok(());
            }
            let mut text = String::from("<b>Ваши замены:</b>\n");
            for a in &aliases {
                text.push_str(&format!(
                    "• {} ➝ <b>{}</b>\n",
                    escape_html(&a.original_name),
                    escape_html(&a.alias_name)
                ));
            }
            text.push_str(
                "\nДля удаления: <code>/unalias [Имя]</code>\n\
                 Добавление: <code>/alias Старое Имя = Новое Имя</code>",
            );
            reply(bot, chat, &text).await;
        }
        AliasRequest::Remove(name) => {
            let text = if db::delete_alias(pool, user_id, &name).await? {
                format!("🗑 Алиас для '{}' удален.", escape_html(&name))
            } else {
                format!("Алиаса для '{}' нет.", escape_html(&name))
            };
            reply(bot, chat, &text).await;
        }
        AliasRequest::Set { original, alias } => {
            db::upsert_alias(pool, user_id, &original, &alias).await?;
            reply(
                bot,
                chat,
                &format!(
                    "✅ Готово! Теперь <b>{}</b> будет отображаться как <b>{}</b>.",
                    escape_html(&original),
                    escape_html(&alias)
                ),
            )
            .await;
        }
        AliasRequest::Malformed => {
            reply(
                bot,
                chat,
                "❌ Неверный формат. Используйте знак '='.\nПример: <code>/alias Физика = Физра</code>",
            )
            .await;
        }
        AliasRequest::TooShort => reply(bot, chat, "⚠️ Названия слишком короткие.").await,
    }
    Ok(())
}

/// Run one cycle, rewriting a single status message with each progress line.
async fn run_with_status(
    bot: &Bot,
    chat: ChatId,
    updater: &Updater,
    intro: &str,
    force: bool,
) -> Result<()> {
    let status_msg = bot
        .send_message(chat, intro)
        .parse_mode(ParseMode::Html)
        .await?;
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let editor = tokio::spawn(edit_status(bot.clone(), chat, status_msg.id, rx));

    let report = move |line: &str| {
        let _ = tx.send(line.to_string());
    };
    let outcome = updater.force_update(&report, force).await;
    drop(report);
    let _ = editor.await;

    if let Ok(outcome) = outcome {
        debug!(?outcome, "manual cycle finished");
    }
    Ok(())
}

async fn edit_status(
    bot: Bot,
    chat: ChatId,
    message: MessageId,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(err) = bot.edit_message_text(chat, message, line).await {
            debug!(?err, "status edit skipped");
        }
    }
}

fn stats_message(users: usize, groups: usize, lessons: i64, ingestion: &IngestionState) -> String {
    let when = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.with_timezone(&Local).format("%d.%m %H:%M").to_string())
            .unwrap_or_else(|| "—".to_string())
    };
    format!(
        "📊 <b>Статистика бота</b>\n\n\
         👥 Пользователей: <b>{}</b>\n\
         🎓 Групп: <b>{}</b>\n\
         📅 Записей уроков: <b>{}</b>\n\n\
         🕵️ Последняя проверка: <b>{}</b>\n\
         💾 Последнее обновление: <b>{}</b>",
        users,
        groups,
        lessons,
        when(ingestion.last_check_time),
        when(ingestion.last_successful_update)
    )
}
