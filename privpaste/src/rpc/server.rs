use crate::{
    error::Error,
    imsg::{Frame, Handler, Message},
    net::Fd,
    rpc::{MessageType, StoreError, StoreRequest, StoreResponse},
    store::Store,
};
use privpaste_log::{debug, warn};
use std::sync::Arc;

/// Store end of the connection.
///
/// Requests are answered strictly in order.  The engine runs on the
/// blocking pool so that slow disks do not stall the reactor.
#[derive(Debug)]
pub struct StoreServer {
    store: Arc<Store>,
    control: Handler,
    descriptors: Handler,
}

impl StoreServer {
    pub fn new(store: Arc<Store>, control: Handler, descriptors: Handler) -> Self {
        Self {
            store,
            control,
            descriptors,
        }
    }

    /// Serve requests until the peer closes the control channel.
    pub async fn run(&self) -> Result<(), Error> {
        while self.serve_one().await? {}
        debug!("control channel closed by peer");
        Ok(())
    }

    /// Answer the next request; returns false on end-of-stream.
    pub async fn serve_one(&self) -> Result<bool, Error> {
        let frame = match self.control.recv_frame().await? {
            Some(frame) => frame,
            None => return Ok(false),
        };
        let seq = frame.message.seq;
        let request = parse_request(&frame)?;
        let kind = request.message_type();

        let store = self.store.clone();
        let (response, fd) = tokio::task::spawn_blocking(move || dispatch(&store, request))
            .await?;

        debug!("store request"; "request" => ?kind, "response" => ?response.message_type(), "seq" => seq);

        self.control
            .send_message(Message::new(response.message_type()).with_seq(seq), None, &response)
            .await?;

        if let Some(fd) = fd {
            self.descriptors
                .send_message(
                    Message::new(MessageType::Descriptor).with_seq(seq),
                    Some(&fd),
                    &(),
                )
                .await?;
        }

        Ok(true)
    }

    /// Close both channels.
    pub fn shutdown(&self) {
        self.control.shutdown();
        self.descriptors.shutdown();
    }
}

/// Validate the header before the body is decoded.
fn parse_request(frame: &Frame) -> Result<StoreRequest, Error> {
    if frame.fd.is_some() {
        return Err(Error::Protocol("descriptor on the control channel"));
    }
    let kind = MessageType::try_from(frame.message.id)
        .map_err(|_| Error::Protocol("unknown request type"))?;
    if !kind.is_request() {
        return Err(Error::Protocol("unexpected message type"));
    }
    let request: StoreRequest = frame
        .decode()
        .map_err(|_| Error::Protocol("malformed request"))?;
    if request.message_type() != kind {
        return Err(Error::Protocol("request does not match its header"));
    }
    Ok(request)
}

/// Run one request against the engine.
fn dispatch(store: &Store, request: StoreRequest) -> (StoreResponse, Option<Fd>) {
    let result = match request {
        StoreRequest::Create {
            size,
            mime,
            lifetime,
        } => store
            .create(size, &mime, lifetime)
            .map(|(item, file)| {
                (
                    StoreResponse::Created {
                        id: item.id,
                        owner: item.owner,
                        expires_at: item.expires_at,
                    },
                    Some(Fd::from(file)),
                )
            }),
        StoreRequest::Fetch { id } => store
            .fetch(&id)
            .map(|(item, file)| (StoreResponse::Fetched(item.info()), Some(Fd::from(file)))),
        StoreRequest::Delete { id, owner } => store
            .delete(&id, &owner)
            .map(|()| (StoreResponse::Deleted, None)),
        StoreRequest::Commit { id, owner } => store
            .commit(&id, &owner)
            .map(|size| (StoreResponse::Committed { size }, None)),
        StoreRequest::Abort { id, owner } => store
            .abort(&id, &owner)
            .map(|()| (StoreResponse::Aborted, None)),
    };

    match result {
        Ok(response) => response,
        Err(Error::Store(err)) => (StoreResponse::Failed(err), None),
        Err(err) => {
            warn!("store request failed"; "error" => %err);
            (StoreResponse::Failed(StoreError::Internal), None)
        }
    }
}
