use crate::{
    error::Error,
    imsg::{Handler, Message},
    net::Fd,
    rpc::{ItemInfo, MessageType, StoreError, StoreRequest, StoreResponse},
};
use privpaste_log::{debug, error};
use std::{
    fs::File,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{watch, Mutex},
    time,
};

/// A newly allocated item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub id: String,
    pub owner: String,
    pub expires_at: SystemTime,
}

/// Client end of the store connection.
///
/// The connection carries one request at a time: a call holds the lock
/// until its response, and any descriptor announced by it, has been
/// consumed.  Calls run in their own task, so a caller that goes away
/// never leaves an unread response behind.  Any transport error, or a
/// call that does not finish within the timeout, breaks the client for
/// good.
#[derive(Debug, Clone)]
pub struct StoreClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    control: Handler,
    descriptors: Handler,
    timeout: Duration,
    lock: Mutex<()>,
    seq: AtomicU32,
    broken: AtomicBool,
    failure: watch::Sender<bool>,
}

impl StoreClient {
    pub fn new(control: Handler, descriptors: Handler, timeout: Duration) -> Self {
        let (failure, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                control,
                descriptors,
                timeout,
                lock: Mutex::new(()),
                seq: AtomicU32::new(1),
                broken: AtomicBool::new(false),
                failure,
            }),
        }
    }

    /// Allocate a new item and return its writable file.
    pub async fn create(
        &self,
        size: u64,
        mime: &str,
        lifetime: Duration,
    ) -> Result<(Created, File), Error> {
        let request = StoreRequest::Create {
            size,
            mime: mime.to_string(),
            lifetime,
        };
        match self.call(request).await? {
            (
                StoreResponse::Created {
                    id,
                    owner,
                    expires_at,
                },
                Some(fd),
            ) => Ok((
                Created {
                    id,
                    owner,
                    expires_at,
                },
                fd.into_file(),
            )),
            (response, _) => Err(unexpected(response)),
        }
    }

    /// Look up an item and return its read-only file.
    pub async fn fetch(&self, id: &str) -> Result<(ItemInfo, File), Error> {
        let request = StoreRequest::Fetch { id: id.to_string() };
        match self.call(request).await? {
            (StoreResponse::Fetched(info), Some(fd)) => Ok((info, fd.into_file())),
            (response, _) => Err(unexpected(response)),
        }
    }

    pub async fn delete(&self, id: &str, owner: &str) -> Result<(), Error> {
        let request = StoreRequest::Delete {
            id: id.to_string(),
            owner: owner.to_string(),
        };
        match self.call(request).await? {
            (StoreResponse::Deleted, _) => Ok(()),
            (response, _) => Err(unexpected(response)),
        }
    }

    /// Make a fully written and closed item readable.
    pub async fn commit(&self, id: &str, owner: &str) -> Result<u64, Error> {
        let request = StoreRequest::Commit {
            id: id.to_string(),
            owner: owner.to_string(),
        };
        match self.call(request).await? {
            (StoreResponse::Committed { size }, _) => Ok(size),
            (response, _) => Err(unexpected(response)),
        }
    }

    pub async fn abort(&self, id: &str, owner: &str) -> Result<(), Error> {
        let request = StoreRequest::Abort {
            id: id.to_string(),
            owner: owner.to_string(),
        };
        match self.call(request).await? {
            (StoreResponse::Aborted, _) => Ok(()),
            (response, _) => Err(unexpected(response)),
        }
    }

    /// Returns true once the connection is unusable.
    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::SeqCst)
    }

    /// Wait until the connection breaks.
    pub async fn failed(&self) {
        let mut receiver = self.inner.failure.subscribe();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                break;
            }
        }
    }

    /// Close both channels; the store observes end-of-stream.
    pub fn close(&self) {
        self.inner.close();
    }

    async fn call(&self, request: StoreRequest) -> Result<(StoreResponse, Option<Fd>), Error> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.call(request).await }).await?
    }
}

impl Inner {
    async fn call(&self, request: StoreRequest) -> Result<(StoreResponse, Option<Fd>), Error> {
        let _guard = self.lock.lock().await;

        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Protocol("store connection is closed"));
        }

        let result = match time::timeout(self.timeout, self.transact(&request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match result {
            Ok((StoreResponse::Failed(err), _)) => Err(Error::Store(err)),
            Ok(response) => Ok(response),
            Err(err) => {
                error!("store connection failed";
                    "request" => ?request.message_type(),
                    "error" => %err);
                self.fail();
                Err(err)
            }
        }
    }

    async fn transact(
        &self,
        request: &StoreRequest,
    ) -> Result<(StoreResponse, Option<Fd>), Error> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let kind = request.message_type();

        self.control
            .send_message(Message::new(kind).with_seq(seq), None, request)
            .await?;

        let frame = self
            .control
            .recv_frame()
            .await?
            .ok_or(Error::Protocol("store closed the control channel"))?;
        if frame.fd.is_some() {
            return Err(Error::Protocol("descriptor on the control channel"));
        }
        if frame.message.seq != seq {
            return Err(Error::Protocol("response out of sequence"));
        }

        // Check the tag before decoding the body.
        let response_kind = MessageType::try_from(frame.message.id)
            .map_err(|_| Error::Protocol("unknown response type"))?;
        if !request.accepts(response_kind) {
            return Err(Error::Protocol("unexpected response type"));
        }
        let response: StoreResponse = frame
            .decode()
            .map_err(|_| Error::Protocol("malformed response"))?;
        if response.message_type() != response_kind {
            return Err(Error::Protocol("response does not match its header"));
        }

        let fd = if response.carries_descriptor() {
            let handoff = self
                .descriptors
                .recv_frame()
                .await?
                .ok_or(Error::Protocol("store closed the descriptor channel"))?;
            if handoff.message.id != u32::from(MessageType::Descriptor)
                || handoff.message.seq != seq
            {
                return Err(Error::Protocol("descriptor out of sequence"));
            }
            Some(
                handoff
                    .fd
                    .ok_or(Error::Protocol("descriptor handoff without descriptor"))?,
            )
        } else {
            None
        };

        debug!("store call"; "request" => ?kind, "response" => ?response_kind, "seq" => seq);

        Ok((response, fd))
    }

    fn fail(&self) {
        if !self.broken.swap(true, Ordering::SeqCst) {
            self.close();
            self.failure.send_replace(true);
        }
    }

    fn close(&self) {
        self.control.shutdown();
        self.descriptors.shutdown();
    }
}

fn unexpected(response: StoreResponse) -> Error {
    match response {
        StoreResponse::Failed(err) => Error::Store(err),
        _ => Error::Store(StoreError::Internal),
    }
}
