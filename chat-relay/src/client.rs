use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    config::ClientConfig,
    message::{
        Command, CommandKind, FrameError, Response, ResponseKind, read_message, write_message,
    },
};

const HELP: &[&str] = &[
    "*** /start <nick> <text>  open a conversation",
    "*** /msg <nick> <text>    send a message",
    "*** <text>                message the current conversation",
    "*** /end [nick]           end a conversation",
    "*** /users                list online users",
    "*** /quit                 disconnect",
];

pub async fn run(args: ClientArgs) -> Result<()> {
    let config = ClientConfig::load(&args.config)?;
    let (reader, mut writer) = establish_connection(&config).await?;
    write_message(&mut writer, &Command::connect(&args.nickname))
        .await
        .context("failed to send connect request")?;

    let mut chat = ChatState::new(args.nickname);
    let (mut server_rx, reader_task) = spawn_server_reader(reader);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let result = run_client_loop(&mut chat, &mut server_rx, &mut writer, &mut stdin).await;
    reader_task.abort();
    shutdown_connection(&mut writer).await;

    result
}

type ServerMessage = Result<Option<Response>, FrameError>;

/// Reads server frames on their own task so that a half-received frame is
/// never dropped when another `select!` branch wins. The channel ends after
/// end of stream or a fatal frame error has been forwarded.
fn spawn_server_reader<R>(mut reader: R) -> (mpsc::Receiver<ServerMessage>, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    let task = tokio::spawn(async move {
        loop {
            let message = read_message::<_, Response>(&mut reader).await;
            let last = match &message {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => err.is_fatal(),
            };
            if tx.send(message).await.is_err() || last {
                break;
            }
        }
    });
    (rx, task)
}

async fn establish_connection(
    config: &ClientConfig,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let server = config.server();
    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    info!("connected to {server}");

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// What the terminal user typed.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientInput {
    Start { to: String, text: String },
    Message { to: String, text: String },
    Say(String),
    End { to: Option<String> },
    Users,
    Help,
    Quit,
}

impl ClientInput {
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(ClientInput::Say(line.to_string())));
        };

        let (word, args) = rest.split_once(' ').unwrap_or((rest, ""));
        let input = match word.to_ascii_lowercase().as_str() {
            "start" | "msg" => {
                let (to, text) = args
                    .trim_start()
                    .split_once(' ')
                    .ok_or_else(|| format!("usage: /{word} <nick> <text>"))?;
                let (to, text) = (to.to_string(), text.to_string());
                if word.eq_ignore_ascii_case("start") {
                    ClientInput::Start { to, text }
                } else {
                    ClientInput::Message { to, text }
                }
            }
            "end" => ClientInput::End {
                to: Some(args.trim())
                    .filter(|to| !to.is_empty())
                    .map(str::to_string),
            },
            "users" => ClientInput::Users,
            "help" => ClientInput::Help,
            "quit" => ClientInput::Quit,
            _ => return Err(format!("unknown command '/{word}' - try /help")),
        };
        Ok(Some(input))
    }
}

struct ChatState {
    nickname: String,
    registered: bool,
    online: Vec<String>,
    partner: Option<String>,
}

impl ChatState {
    fn new(nickname: String) -> Self {
        Self {
            nickname,
            registered: false,
            online: Vec::new(),
            partner: None,
        }
    }

    fn command(&self, kind: CommandKind, to: &str, text: &str) -> Command {
        Command::new(kind, self.nickname.as_str(), to, text)
    }
}

async fn run_client_loop(
    chat: &mut ChatState,
    server_rx: &mut mpsc::Receiver<ServerMessage>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    loop {
        select! {
            server_message = server_rx.recv() => {
                let server_message = server_message.unwrap_or(Ok(None));
                if !handle_server_message(chat, server_message).await? {
                    break;
                }
            }
            input = stdin.next_line() => {
                if !handle_stdin_input(chat, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                send_disconnect(chat, writer).await;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    chat: &mut ChatState,
    message: ServerMessage,
) -> Result<bool> {
    let response = match message {
        Ok(Some(response)) => response,
        Ok(None) => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        Err(err) if !err.is_fatal() => {
            warn!(error = %err, "ignoring unreadable server message");
            return Ok(true);
        }
        Err(err) => return Err(err).context("lost connection to server"),
    };

    match response.kind {
        ResponseKind::Users => {
            if !chat.registered {
                chat.registered = true;
                write_stdout(&format!("*** connected as {}", chat.nickname)).await?;
            }
            chat.online = response.nicknames().unwrap_or_default().to_vec();
            write_stdout(&format!("*** online: {}", chat.online.join(", "))).await?;
        }
        ResponseKind::Message => {
            let sender = response.sender().unwrap_or("?");
            write_stdout(&format!("<{sender}> {}", response.message.trim_end())).await?;
            if chat.partner.is_none() {
                chat.partner = Some(sender.to_string());
            }
        }
        ResponseKind::EndConversation => {
            let sender = response.sender().unwrap_or("?");
            write_stdout(&format!("*** {sender} ended the conversation")).await?;
            if chat.partner.as_deref() == Some(sender) {
                chat.partner = None;
            }
        }
        ResponseKind::RejectConnection => {
            write_stderr(&format!("!!! {}", response.message)).await?;
            bail!("connection rejected: {}", response.message);
        }
        ResponseKind::Error => write_stderr(&format!("!!! {}", response.message)).await?,
        ResponseKind::Info => write_stdout(&format!("*** {}", response.message)).await?,
        ResponseKind::ServerClose => {
            write_stdout(&format!("*** server closed: {}", response.message)).await?;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn handle_stdin_input(
    chat: &mut ChatState,
    input: io::Result<Option<String>>,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let Some(input) = input? else {
        send_disconnect(chat, writer).await;
        return Ok(false);
    };

    let parsed = match ClientInput::parse(&input) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Ok(true),
        Err(usage) => {
            write_stderr(&format!("!!! {usage}")).await?;
            return Ok(true);
        }
    };

    let command = match parsed {
        ClientInput::Start { to, text } => {
            let command = chat.command(CommandKind::StartConversation, &to, &text);
            chat.partner = Some(to);
            command
        }
        ClientInput::Message { to, text } => {
            chat.command(CommandKind::SendMessage, &to, &text)
        }
        ClientInput::Say(text) => match chat.partner.as_deref() {
            Some(to) => chat.command(CommandKind::SendMessage, to, &text),
            None => {
                write_stderr("!!! no open conversation - use /start <nick> <text>").await?;
                return Ok(true);
            }
        },
        ClientInput::End { to } => {
            let Some(to) = to.or_else(|| chat.partner.clone()) else {
                write_stderr("!!! no open conversation to end").await?;
                return Ok(true);
            };
            if chat.partner.as_deref() == Some(to.as_str()) {
                chat.partner = None;
            }
            chat.command(CommandKind::EndConversation, &to, "")
        }
        ClientInput::Users => {
            write_stdout(&format!("*** online: {}", chat.online.join(", "))).await?;
            return Ok(true);
        }
        ClientInput::Help => {
            for line in HELP {
                write_stdout(line).await?;
            }
            return Ok(true);
        }
        ClientInput::Quit => {
            send_disconnect(chat, writer).await;
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
    };

    write_message(writer, &command)
        .await
        .context("failed to send to server")?;
    Ok(true)
}

async fn send_disconnect(chat: &ChatState, writer: &mut OwnedWriteHalf) {
    if !chat.registered {
        return;
    }
    if let Err(error) = write_message(writer, &Command::disconnect(chat.nickname.as_str())).await {
        warn!(?error, "failed to send disconnect");
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
