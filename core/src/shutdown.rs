//! Cooperative shutdown for the satellite's long-running tasks.
//!
//! A [`Controller`] is cloned into every task. Any clone may trigger a
//! shutdown with a reason; [`Controller::with_cancel`] races a future against
//! that trigger, and [`DelayToken`]s keep [`Controller::completed_shutdown`]
//! pending until every critical section has finished.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

pub struct Controller<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Clone for Controller<T> {
	fn clone(&self) -> Self {
		Controller {
			inner: self.inner.clone(),
		}
	}
}

struct ControllerInner<T> {
	reason: Option<T>,
	delay_tokens: usize,
	on_shutdown_trigger: Vec<Waker>,
	on_shutdown_complete: Vec<Waker>,
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Controller {
			inner: Arc::new(Mutex::new(ControllerInner {
				reason: None,
				delay_tokens: 0,
				on_shutdown_trigger: Vec::new(),
				on_shutdown_complete: Vec::new(),
			})),
		}
	}

	/// Starts a shutdown. Returns the already-set reason as an error if a
	/// shutdown is in progress.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), T> {
		let mut inner = self.inner.lock().expect("lock acquired");
		if let Some(existing) = inner.reason.as_ref() {
			return Err(existing.clone());
		}
		inner.reason = Some(reason);
		for waker in inner.on_shutdown_trigger.drain(..) {
			waker.wake();
		}
		for waker in inner.on_shutdown_complete.drain(..) {
			waker.wake();
		}
		Ok(())
	}

	pub fn is_triggered(&self) -> bool {
		self.inner.lock().expect("lock acquired").reason.is_some()
	}

	/// Future resolving with the shutdown reason once a shutdown triggers.
	pub fn triggered_shutdown(&self) -> Triggered<T> {
		Triggered {
			inner: self.inner.clone(),
		}
	}

	/// Future resolving once a shutdown has triggered and every delay token
	/// has been dropped.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Holds shutdown completion open until the token is dropped. Fails with
	/// the reason if a shutdown has already been triggered.
	pub fn delay_token(&self) -> Result<DelayToken<T>, T> {
		let mut inner = self.inner.lock().expect("lock acquired");
		if let Some(reason) = inner.reason.as_ref() {
			return Err(reason.clone());
		}
		inner.delay_tokens += 1;
		Ok(DelayToken {
			inner: self.inner.clone(),
		})
	}

	/// Runs `future` until it completes or a shutdown triggers, whichever
	/// happens first.
	pub async fn with_cancel<F: Future>(&self, future: F) -> Result<F::Output, T> {
		let triggered = self.triggered_shutdown();
		tokio::pin!(future);
		tokio::select! {
			reason = triggered => Err(reason),
			output = &mut future => Ok(output),
		}
	}

	/// Runs `future` to completion and then triggers a shutdown with the
	/// given reason.
	pub async fn with_trigger<F: Future>(&self, reason: T, future: F) -> F::Output {
		let output = future.await;
		let _ = self.trigger_shutdown(reason);
		output
	}

	/// Triggers a shutdown when the process receives a termination signal.
	pub async fn on_user_signal(&self, reason: T) {
		user_signal().await;
		let _ = self.trigger_shutdown(reason);
	}
}

pub struct Triggered<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Triggered<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().expect("lock acquired");
		if let Some(reason) = inner.reason.as_ref() {
			return Poll::Ready(reason.clone());
		}
		// always push a fresh waker, so we don't end up with stale ones
		inner.on_shutdown_trigger.push(cx.waker().clone());
		Poll::Pending
	}
}

/// Completes when all tokens have been dropped and a reason for the shutdown
/// has been provided. Otherwise the future stays pending, registering the
/// context's waker for notification upon shutdown completion.
pub struct Completed<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Completed<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().expect("lock acquired");
		if let (0, Some(reason)) = (inner.delay_tokens, inner.reason.as_ref()) {
			return Poll::Ready(reason.clone());
		}
		inner.on_shutdown_complete.push(cx.waker().clone());
		Poll::Pending
	}
}

pub struct DelayToken<T> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T> Drop for DelayToken<T> {
	fn drop(&mut self) {
		let mut inner = self.inner.lock().expect("lock acquired");
		inner.delay_tokens -= 1;
		if inner.delay_tokens == 0 && inner.reason.is_some() {
			for waker in inner.on_shutdown_complete.drain(..) {
				waker.wake();
			}
		}
	}
}

/// Completes upon receiving any of the default termination signals: Ctrl-C
/// (SIGINT) or SIGTERM on Unix, Ctrl-C, Ctrl-Close or Ctrl-Shutdown on
/// Windows.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let sig = async {
			let mut os_sig =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			os_sig.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = sig => {}
		}
	}

	#[cfg(windows)]
	{
		let ctrl_close = async {
			let mut sig = tokio::signal::windows::ctrl_close()?;
			sig.recv().await;
			std::io::Result::Ok(())
		};
		let ctrl_shutdown = async {
			let mut sig = tokio::signal::windows::ctrl_shutdown()?;
			sig.recv().await;
			std::io::Result::Ok(())
		};
		tokio::select! {
			_ = ctrl_c => {},
			_ = ctrl_close => {},
			_ = ctrl_shutdown => {},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn with_cancel_returns_the_reason_once_triggered() {
		let shutdown: Controller<String> = Controller::new();
		shutdown.trigger_shutdown("stop".to_string()).unwrap();
		let result = shutdown
			.with_cancel(async { std::future::pending::<()>().await })
			.await;
		assert_eq!(result.unwrap_err(), "stop");
	}

	#[tokio::test]
	async fn completion_waits_for_delay_tokens() {
		let shutdown: Controller<String> = Controller::new();
		let token = shutdown.delay_token().unwrap();
		shutdown.trigger_shutdown("stop".to_string()).unwrap();

		let mut completed = Box::pin(shutdown.completed_shutdown());
		assert!(futures::poll!(completed.as_mut()).is_pending());

		drop(token);
		assert_eq!(completed.await, "stop");
	}

	#[tokio::test]
	async fn delay_tokens_are_refused_after_trigger() {
		let shutdown: Controller<String> = Controller::new();
		shutdown.trigger_shutdown("stop".to_string()).unwrap();
		assert!(shutdown.delay_token().is_err());
	}
}
