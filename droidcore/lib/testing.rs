//! A scripted command gateway for unit tests.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use droidutils::{
    join_command, BoxedReader, CommandGateway, CommandOutput, DirEntry, DroidutilsError,
    DroidutilsResult, FileEntry, LineStream, LocalGateway,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type Responder = Box<dyn Fn(&str) -> (i32, String) + Send + Sync>;

/// Answers commands from a closure and records them. File operations hit the local filesystem.
pub(crate) struct ScriptedGateway {
    responder: Responder,
    history: Mutex<Vec<String>>,
    local: LocalGateway,
    remote: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ScriptedGateway {
    /// Creates a gateway answering every command with `responder(command_line)`.
    pub(crate) fn new(
        responder: impl Fn(&str) -> (i32, String) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            history: Mutex::new(Vec::new()),
            local: LocalGateway,
            remote: false,
        })
    }

    /// Like [`ScriptedGateway::new`], but reports itself as a remote host.
    pub(crate) fn new_remote(
        responder: impl Fn(&str) -> (i32, String) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            history: Mutex::new(Vec::new()),
            local: LocalGateway,
            remote: true,
        })
    }

    /// Every command line seen so far, in order.
    pub(crate) fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    /// How many recorded command lines contain `needle`.
    pub(crate) fn count(&self, needle: &str) -> usize {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.contains(needle))
            .count()
    }

    fn answer(&self, command: String) -> CommandOutput {
        let (code, output) = (self.responder)(&command);
        self.history.lock().unwrap().push(command);
        CommandOutput {
            output,
            code: Some(code),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CommandGateway for ScriptedGateway {
    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn exec(&self, program: &str, args: &[String]) -> DroidutilsResult<CommandOutput> {
        Ok(self.answer(join_command(program, args)))
    }

    async fn exec_script(&self, script: &str) -> DroidutilsResult<CommandOutput> {
        Ok(self.answer(script.to_string()))
    }

    async fn exists(&self, path: &Path) -> bool {
        self.local.exists(path).await
    }

    async fn is_dir(&self, path: &Path) -> bool {
        self.local.is_dir(path).await
    }

    async fn read_file(&self, path: &Path) -> DroidutilsResult<Vec<u8>> {
        self.local.read_file(path).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> DroidutilsResult<()> {
        self.local.write_file(path, contents).await
    }

    async fn list_dir(&self, path: &Path) -> DroidutilsResult<Vec<DirEntry>> {
        self.local.list_dir(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> DroidutilsResult<()> {
        self.local.create_dir_all(path).await
    }

    async fn remove_all(&self, path: &Path) -> DroidutilsResult<()> {
        self.local.remove_all(path).await
    }

    async fn list_files(&self, dir: &Path) -> DroidutilsResult<Vec<FileEntry>> {
        self.local.list_files(dir).await
    }

    async fn open_read(&self, path: &Path) -> DroidutilsResult<(u64, BoxedReader)> {
        self.local.open_read(path).await
    }

    async fn write_from_reader(&self, path: &Path, reader: BoxedReader) -> DroidutilsResult<u64> {
        self.local.write_from_reader(path, reader).await
    }

    async fn spawn_stream(&self, program: &str, args: &[String]) -> DroidutilsResult<LineStream> {
        let output = self.answer(join_command(program, args)).output;
        let lines = output
            .lines()
            .map(|line| Ok::<_, DroidutilsError>(line.to_string()))
            .collect::<Vec<_>>();
        Ok(Box::pin(futures::stream::iter(lines)))
    }
}
