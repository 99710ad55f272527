use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf},
    process::{Child, ChildStdout},
};

use crate::{DroidutilsError, DroidutilsResult};

use super::LineStream;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pin_project! {
    /// Reads the stdout of a child process.
    ///
    /// The child is owned by the reader, so a child spawned with `kill_on_drop` lives exactly as
    /// long as its output is being consumed.
    pub struct ChildReader {
        #[pin]
        stdout: ChildStdout,
        child: Child,
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ChildReader {
    /// Wraps a child whose stdout was configured as piped.
    pub fn new(mut child: Child) -> DroidutilsResult<Self> {
        let stdout = child.stdout.take().ok_or_else(|| {
            DroidutilsError::custom(anyhow::anyhow!("child process stdout was not piped"))
        })?;

        Ok(Self { stdout, child })
    }

    /// The OS process id of the child, if it is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Turns a child's stdout into a stream of lines.
pub fn line_stream(child: Child) -> DroidutilsResult<LineStream> {
    let reader = ChildReader::new(child)?;
    let stream = async_stream::stream! {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => yield Ok::<_, DroidutilsError>(line),
                Ok(None) => break,
                Err(e) => {
                    yield Err(DroidutilsError::from(e));
                    break;
                }
            }
        }
    };

    Ok(Box::pin(stream))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl AsyncRead for ChildReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stdout.poll_read(cx, buf)
    }
}
