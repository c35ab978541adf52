//! Interactive REPL-style command-line interface client.

use std::io::{self, Write};
use std::path::Path;
use std::str::SplitWhitespace;

use color_print::{cprint, cprintln};

use splitfs::{ClientApiStub, NodeAddr, SplitfsError};

use tokio::fs;

/// Prompt string at the start of line.
const PROMPT: &str = "splitfs> ";

/// Recognizable command types.
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    /// Point the client at a master.
    Connect(NodeAddr),

    /// Upload a local file.
    Put { path: String },

    /// Download a stored file into a local destination.
    Get { file: String, dest: String },

    /// List stored files.
    Ls,

    /// Remove a stored file.
    Rm { file: String },

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
pub struct ClientRepl {
    /// API stub of the connected master, if any.
    stub: Option<ClientApiStub>,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client, optionally already pointed at a
    /// master.
    pub fn new(master: Option<NodeAddr>) -> Self {
        ClientRepl {
            stub: master.map(ClientApiStub::new),
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    #[inline]
    fn print_prompt() -> Result<(), SplitfsError> {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush()?;
        Ok(())
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&SplitfsError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported commands are:");
        println!("          connect <host>:<port>");
        println!("          put <local_path>");
        println!("          get <file> <local_dest>");
        println!("          ls");
        println!("          rm <file>");
        println!("          help");
        println!("          exit");
        println!("      File names cannot contain whitespaces");
    }

    /// Expect to get the next segment string from parsed segs.
    #[inline]
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
    ) -> Result<&'s str, SplitfsError> {
        segs.next().ok_or_else(|| {
            SplitfsError::MalformedCommand("not enough args".into())
        })
    }

    /// Parses one input line into a command.
    fn parse_command(line: &str) -> Result<ReplCommand, SplitfsError> {
        // split input line by whitespaces, getting an iterator of segments
        let mut segs = line.split_whitespace();
        let Some(cmd_type) = segs.next() else {
            return Ok(ReplCommand::Nothing);
        };

        // get command type, match case-insensitively
        match &cmd_type.to_lowercase()[..] {
            "connect" => {
                let addr = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Connect(addr.parse()?))
            }

            "put" => {
                let path = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Put { path: path.into() })
            }

            "get" => {
                let file = Self::expect_next_seg(&mut segs)?;
                let dest = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Get {
                    file: file.into(),
                    dest: dest.into(),
                })
            }

            "ls" => Ok(ReplCommand::Ls),

            "rm" => {
                let file = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Rm { file: file.into() })
            }

            "help" => Ok(ReplCommand::PrintHelp),

            "exit" | "quit" => Ok(ReplCommand::Exit),

            _ => Err(SplitfsError::MalformedCommand(format!(
                "unrecognized command: {}",
                cmd_type
            ))),
        }
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, SplitfsError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }
        Self::parse_command(&self.input_buf)
    }

    fn stub(&self) -> Result<&ClientApiStub, SplitfsError> {
        self.stub.as_ref().ok_or_else(|| {
            SplitfsError::msg("not connected, use 'connect <host>:<port>'")
        })
    }

    /// Issues the command to the master and prints the outcome.
    async fn eval_command(
        &mut self,
        cmd: ReplCommand,
    ) -> Result<(), SplitfsError> {
        match cmd {
            ReplCommand::Connect(addr) => {
                cprintln!("<bright-blue>#</> using master {}", addr);
                self.stub = Some(ClientApiStub::new(addr));
            }

            ReplCommand::Put { path } => {
                let file = Path::new(&path)
                    .file_name()
                    .and_then(|f| f.to_str())
                    .ok_or_else(|| {
                        SplitfsError::MalformedCommand(format!(
                            "no file name in '{}'",
                            path
                        ))
                    })?
                    .to_string();
                let text = fs::read_to_string(&path).await?;
                let lines: Vec<String> =
                    text.lines().map(|l| l.to_string()).collect();
                let receipt = self.stub()?.put(&file, &lines).await?;
                cprintln!(
                    "<bright-green>✓</> uploaded '{}': {} line(s), {} \
                     partition(s), {} cop(ies)",
                    receipt.file,
                    lines.len(),
                    receipt.partitions,
                    receipt.placements
                );
            }

            ReplCommand::Get { file, dest } => {
                let text = self.stub()?.get(&file).await?;
                fs::write(&dest, &text).await?;
                cprintln!(
                    "<bright-green>✓</> saved '{}' to '{}' ({} bytes)",
                    file,
                    dest,
                    text.len()
                );
            }

            ReplCommand::Ls => {
                for block in self.stub()?.ls().await? {
                    print!("{}", block);
                    if !block.ends_with('\n') {
                        println!();
                    }
                }
            }

            ReplCommand::Rm { file } => {
                self.stub()?.rm(&file).await?;
                cprintln!("<bright-green>✓</> {} removed", file);
            }

            ReplCommand::PrintHelp => Self::print_help(None),

            ReplCommand::Exit | ReplCommand::Nothing => {}
        }
        Ok(())
    }

    /// One iteration of the REPL loop.
    async fn iter(&mut self) -> Result<bool, SplitfsError> {
        Self::print_prompt()?;

        let cmd = match self.read_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                Self::print_help(Some(&e));
                return Ok(true);
            }
        };
        if cmd == ReplCommand::Exit {
            println!("Exiting...");
            return Ok(false);
        }

        if let Err(e) = self.eval_command(cmd).await {
            cprintln!("<bright-red>✗</> {}", e);
        }
        Ok(true)
    }

    /// Runs the infinite REPL loop.
    pub async fn run(&mut self) -> Result<(), SplitfsError> {
        while self.iter().await? {}
        Ok(())
    }
}
