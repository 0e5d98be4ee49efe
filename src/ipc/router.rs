//! Router dispatching inbound requests to per-type handlers

use std::collections::HashMap;

use crate::ipc::manager::{Dispatcher, Inbound, Outbox, PendingRequest};
use crate::ipc::protocol::{IpcError, MessageType, Notification, Request, Response, Status};

/// Type-erased request handler; the returned bytes become the response payload
type ErasedHandler = Box<dyn FnMut(&Request) -> Result<Vec<u8>, IpcError> + Send>;

type NotificationHandler = Box<dyn FnMut(&Notification) + Send>;

type ResponseHandler = Box<dyn FnMut(&PendingRequest, &Response) + Send>;

/// Maps message types to handlers and answers every request it receives
///
/// A request whose type has no handler is answered with [`Status::ERROR`],
/// so the peer never waits on a session that will not complete. `VERSION`
/// is answered with the crate version unless a handler replaces it.
pub struct CommandRouter {
    handlers: HashMap<MessageType, ErasedHandler>,
    on_notification: Option<NotificationHandler>,
    on_response: Option<ResponseHandler>,
}

impl CommandRouter {
    /// Create a router that only knows `VERSION`
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            on_notification: None,
            on_response: None,
        }
        .register(MessageType::VERSION, |_| {
            Ok(env!("CARGO_PKG_VERSION").as_bytes().to_vec())
        })
    }

    /// Register the handler for `message_type`, replacing any previous one
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let router = CommandRouter::new()
    ///     .register(MessageType::LOAD_DRIVER, |_| driver.load().map(|()| Vec::new()));
    /// ```
    pub fn register<F>(mut self, message_type: MessageType, handler: F) -> Self
    where
        F: FnMut(&Request) -> Result<Vec<u8>, IpcError> + Send + 'static,
    {
        self.handlers.insert(message_type, Box::new(handler));
        self
    }

    pub fn on_notification<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.on_notification = Some(Box::new(handler));
        self
    }

    /// Called with each response paired to one of our own requests
    pub fn on_response<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&PendingRequest, &Response) + Send + 'static,
    {
        self.on_response = Some(Box::new(handler));
        self
    }

    pub fn handles(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Run the handler for `request` and pick the response status
    pub fn handle(&mut self, request: &Request) -> (Status, Vec<u8>) {
        let message_type = request.message_type();
        let Some(handler) = self.handlers.get_mut(&message_type) else {
            tracing::warn!(%message_type, "no handler registered");
            return (
                Status::ERROR,
                format!("unsupported command {message_type}").into_bytes(),
            );
        };

        match handler(request) {
            Ok(payload) => (Status::OK, payload),
            Err(e) => {
                tracing::warn!(%message_type, error = %e, "handler failed");
                (Status::ERROR, e.to_string().into_bytes())
            }
        }
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for CommandRouter {
    fn dispatch(&mut self, inbound: Inbound, outbox: &Outbox) {
        match inbound {
            Inbound::Request(request) => {
                let (status, payload) = self.handle(&request);
                if let Err(e) = outbox.send_response(&request, status, &payload) {
                    tracing::warn!(
                        session = request.session(),
                        error = %e,
                        "failed to queue response"
                    );
                }
            }
            Inbound::Response { request, response } => match self.on_response.as_mut() {
                Some(handler) => handler(&request, &response),
                None => tracing::debug!(session = request.session, "response has no listener"),
            },
            Inbound::Notification(notification) => match self.on_notification.as_mut() {
                Some(handler) => handler(&notification),
                None => tracing::debug!(
                    message_type = %notification.message_type(),
                    "notification has no listener"
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_version_is_built_in() {
        let mut router = CommandRouter::new();
        let request = Request::new(MessageType::VERSION, 1, &[]).unwrap();

        let (status, payload) = router.handle(&request);
        assert_eq!(status, Status::OK);
        assert_eq!(payload, env!("CARGO_PKG_VERSION").as_bytes());
    }

    #[test]
    fn test_router_dispatch() {
        let loaded = Arc::new(Mutex::new(Vec::new()));
        let mut router = CommandRouter::new().register(MessageType::COMMAND, {
            let loaded = Arc::clone(&loaded);
            move |request| {
                loaded.lock().unwrap().push(request.session());
                Ok(b"OK".to_vec())
            }
        });

        let request = Request::new(MessageType::COMMAND, 0x42, b"SCAN").unwrap();
        let (status, payload) = router.handle(&request);

        assert_eq!(status, Status::OK);
        assert_eq!(payload, b"OK");
        assert_eq!(*loaded.lock().unwrap(), vec![0x42]);
    }

    #[test]
    fn test_router_unknown_command() {
        let mut router = CommandRouter::new();
        assert!(!router.handles(MessageType::HOSTAPD_COMMAND));

        let request = Request::new(MessageType::HOSTAPD_COMMAND, 3, &[]).unwrap();
        let (status, payload) = router.handle(&request);

        assert_eq!(status, Status::ERROR);
        assert_eq!(payload, b"unsupported command HOSTAPD_COMMAND");
    }

    #[test]
    fn test_handler_error_becomes_error_status() {
        let mut router = CommandRouter::new().register(MessageType::LOAD_DRIVER, |_| {
            Err(IpcError::Handler("firmware missing".to_string()))
        });

        let request = Request::new(MessageType::LOAD_DRIVER, 7, &[]).unwrap();
        let (status, payload) = router.handle(&request);

        assert_eq!(status, Status::ERROR);
        assert!(String::from_utf8(payload).unwrap().contains("firmware missing"));
    }
}
