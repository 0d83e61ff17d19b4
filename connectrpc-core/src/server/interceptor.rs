//! # Server Interceptors
//!
//! A [`ServerInterceptor`] observes and rewrites one call served by a
//! [`ConnectServer`](crate::ConnectServer). A fresh set is created for every call
//! from the [`ServerInterceptorFactory`]s of the [`ServerConfig`], so an
//! interceptor may keep per-call state in `&mut self`.
//!
//! Request hooks run in registration order, response hooks in reverse order.
//! Messages are seen decompressed and without their envelope, whatever the
//! protocol of the call.
use super::ServerConfig;
use crate::ConnectError;
use bytes::Bytes;
use http::HeaderMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Hooks invoked around a single served call. Every hook defaults to passing its
/// input through.
pub trait ServerInterceptor: Send {
    /// Invoked once the call is routed, before its body is read. An error rejects
    /// the call without running the handler.
    fn request(&mut self, procedure: &str, headers: HeaderMap) -> Result<HeaderMap, ConnectError> {
        let _ = procedure;
        Ok(headers)
    }

    /// Invoked for each request message.
    fn request_message(&mut self, message: Bytes) -> Result<Bytes, ConnectError> {
        Ok(message)
    }

    /// Invoked for each response message.
    fn response_message(&mut self, message: Bytes) -> Bytes {
        message
    }

    /// Invoked with the error ending a failed call.
    fn response_error(&mut self, error: ConnectError) -> ConnectError {
        error
    }
}

/// Creates the interceptor instance of one call.
pub type ServerInterceptorFactory =
    Arc<dyn Fn(&ServerConfig) -> Box<dyn ServerInterceptor> + Send + Sync>;

/// The interceptors of one call. Clones share the same instances, so the tasks
/// reading requests and writing responses of a stream see one chain.
#[derive(Clone, Default)]
pub(crate) struct ServerInterceptorChain {
    interceptors: Arc<Mutex<Vec<Box<dyn ServerInterceptor>>>>,
}

impl ServerInterceptorChain {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        let interceptors = config
            .interceptors
            .iter()
            .map(|factory| factory(config))
            .collect();
        Self {
            interceptors: Arc::new(Mutex::new(interceptors)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Box<dyn ServerInterceptor>>> {
        self.interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn request(
        &self,
        procedure: &str,
        headers: HeaderMap,
    ) -> Result<HeaderMap, ConnectError> {
        self.lock()
            .iter_mut()
            .try_fold(headers, |headers, interceptor| {
                interceptor.request(procedure, headers)
            })
    }

    pub(crate) fn request_message(&self, message: Bytes) -> Result<Bytes, ConnectError> {
        self.lock()
            .iter_mut()
            .try_fold(message, |message, interceptor| {
                interceptor.request_message(message)
            })
    }

    pub(crate) fn response_message(&self, message: Bytes) -> Bytes {
        self.lock()
            .iter_mut()
            .rev()
            .fold(message, |message, interceptor| {
                interceptor.response_message(message)
            })
    }

    pub(crate) fn response_error(&self, error: ConnectError) -> ConnectError {
        self.lock()
            .iter_mut()
            .rev()
            .fold(error, |error, interceptor| interceptor.response_error(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;
    use http::HeaderValue;

    struct Tagger {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ServerInterceptor for Tagger {
        fn request(
            &mut self,
            procedure: &str,
            mut headers: HeaderMap,
        ) -> Result<HeaderMap, ConnectError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:request {procedure}", self.name));
            headers.append("x-seen-by", HeaderValue::from_static(self.name));
            Ok(headers)
        }

        fn request_message(&mut self, message: Bytes) -> Result<Bytes, ConnectError> {
            let mut next = message.to_vec();
            next.extend_from_slice(self.name.as_bytes());
            Ok(Bytes::from(next))
        }

        fn response_message(&mut self, message: Bytes) -> Bytes {
            let mut next = message.to_vec();
            next.extend_from_slice(self.name.as_bytes());
            Bytes::from(next)
        }

        fn response_error(&mut self, error: ConnectError) -> ConnectError {
            let message = format!("{}{}", error.message().unwrap_or_default(), self.name);
            error.with_message(message)
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>) -> ServerInterceptorChain {
        let factory = |name: &'static str| -> ServerInterceptorFactory {
            let log = log.clone();
            Arc::new(move |_config: &ServerConfig| {
                Box::new(Tagger {
                    name,
                    log: log.clone(),
                }) as Box<dyn ServerInterceptor>
            })
        };
        let config = ServerConfig::default().with_interceptors(vec![factory("a"), factory("b")]);
        ServerInterceptorChain::new(&config)
    }

    #[test]
    fn request_hooks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);

        let headers = chain.request("svc/Method", HeaderMap::new()).unwrap();
        let seen: Vec<_> = headers.get_all("x-seen-by").iter().collect();
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:request svc/Method", "b:request svc/Method"]
        );
        assert_eq!(
            chain.request_message(Bytes::from_static(b">")).unwrap().as_ref(),
            b">ab"
        );
    }

    #[test]
    fn response_hooks_run_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);

        assert_eq!(
            chain.response_message(Bytes::from_static(b"<")).as_ref(),
            b"<ba"
        );
        let error = chain.response_error(ConnectError::new(Code::Aborted).with_message("<"));
        assert_eq!(error.message(), Some("<ba"));
    }

    #[test]
    fn clones_share_instances() {
        let chain = ServerInterceptorChain::default();
        let other = chain.clone();
        assert!(Arc::ptr_eq(&chain.interceptors, &other.interceptors));
        assert_eq!(other.response_message(Bytes::from_static(b"x")).as_ref(), b"x");
    }
}
