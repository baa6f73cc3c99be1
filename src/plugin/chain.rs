//! Plugin chain runner.
//!
//! One chain per request drives the matched rule's plugins in declaration
//! order. The chain never loops: after each plugin that did not request a
//! stop it yields, and the host re-enters it with an immediate event. A
//! cancelled chain is detected at the next re-entry and terminates without
//! invoking further plugins and without completing.

use std::sync::Arc;

use super::{RemapPlugin, RemapRequestInfo, RemapStatus};
use crate::core::{Action, Continuation, Event, Transaction};
use crate::rewrite::rule::MappingContainer;
use crate::rewrite::url::RewriteUrl;
use crate::rewrite::do_remap;

/// Hard cap on plugin invocations per rule; exceeding it is a logged error.
/// Configurable through `RemapConfig::max_plugin_chain`.
pub const DEFAULT_MAX_PLUGIN_CHAIN: usize = 10;

/// What the host should do with the chain after one re-entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainDisposition {
    /// The chain yielded; schedule another immediate re-entry.
    Reschedule,
    /// The chain completed and delivered `RemapComplete`.
    Finished,
    /// The action was cancelled; no completion was delivered.
    Cancelled,
}

/// Per-request chain state: a cursor over the matched rule's plugin list.
pub struct PluginChain<'a> {
    cur: usize,
    container: &'a MappingContainer,
    request_url: &'a mut RewriteUrl,
    continuation: &'a mut dyn Continuation,
    action: Action,
    max_chain: usize,
}

impl<'a> PluginChain<'a> {
    pub fn new(
        container: &'a MappingContainer,
        request_url: &'a mut RewriteUrl,
        continuation: &'a mut dyn Continuation,
        action: Action,
        max_chain: usize,
    ) -> Self {
        Self {
            cur: 0,
            container,
            request_url,
            continuation,
            action,
            max_chain,
        }
    }

    /// One scheduler re-entry: runs at most one plugin. Completion delivers a
    /// single `RemapComplete` to the continuation; cancellation delivers
    /// nothing.
    pub fn handle_event(&mut self, event: Event, txn: &mut Transaction) -> ChainDisposition {
        if self.action.cancelled() {
            log::debug!("remap chain cancelled before step {}", self.cur);
            return ChainDisposition::Cancelled;
        }

        match event {
            Event::Immediate => {
                if self.run_single_remap(txn) {
                    self.continuation.handle_event(Event::RemapComplete, txn);
                    ChainDisposition::Finished
                } else {
                    ChainDisposition::Reschedule
                }
            }
            other => {
                debug_assert!(false, "unknown event {other:?} delivered to plugin chain");
                log::error!("unknown event {other:?} delivered to plugin chain");
                ChainDisposition::Finished
            }
        }
    }

    /// Returns true when the chain is done. Mirrors one turn of the remap
    /// state machine: invoke the current plugin, then decide between the
    /// default rewrite, an early stop, the chain cap and another yield.
    fn run_single_remap(&mut self, txn: &mut Transaction) -> bool {
        log::debug!("running remap rule, step {}", self.cur);
        let container = self.container;

        let status = match container.mapping.plugins.get(self.cur) {
            Some(plugin) => self.run_plugin(plugin, txn),
            None if self.cur > 0 => {
                self.cur += 1;
                log::debug!("no plugin left to run, completing remap processing");
                return true;
            }
            None => RemapStatus::NoRemap,
        };
        self.cur += 1;

        // A captured redirect ends the chain immediately.
        if txn.remap_redirect.is_some() {
            return true;
        }

        if !status.did_remap() && self.cur == 1 {
            log::debug!("plugin did not change host, port or path, copying from mapping rule");
            do_remap(container, self.request_url);
        }

        if status.stop() {
            log::debug!("breaking remap plugin chain since last plugin said we should stop");
            return true;
        }

        if self.cur > self.max_chain {
            log::error!(
                "remap plugin chain ran more than {} times, stopping it now",
                self.max_chain
            );
            return true;
        }

        if self.cur >= container.mapping.plugin_count() {
            log::debug!("completed all remap plugins for this rule");
            return true;
        }
        false
    }

    fn run_plugin(&mut self, plugin: &Arc<dyn RemapPlugin>, txn: &mut Transaction) -> RemapStatus {
        let container = self.container;
        let mut rri = RemapRequestInfo {
            request_header: &mut txn.request,
            request_url: &mut *self.request_url,
            map_from_url: &container.mapping.from_url,
            map_to_url: container.to_url(),
            redirect: false,
        };

        let status = plugin.do_remap(&mut rri);
        let redirect = rri.redirect;

        if status.did_remap() && redirect {
            txn.remap_redirect = Some(self.request_url.to_string());
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pingora_http::RequestHeader;

    use super::*;
    use crate::core::{Scheduler, StepScheduler};
    use crate::rewrite::rule::UrlMapping;
    use crate::rewrite::url::RewriteUrl;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Scripted plugin: sets the host, optionally flags a redirect, returns a
    /// fixed status and counts its invocations.
    struct ScriptedPlugin {
        set_host: Option<&'static str>,
        redirect: bool,
        status: RemapStatus,
        calls: AtomicUsize,
    }

    impl ScriptedPlugin {
        fn new(set_host: Option<&'static str>, status: RemapStatus) -> Arc<Self> {
            Arc::new(Self {
                set_host,
                redirect: false,
                status,
                calls: AtomicUsize::new(0),
            })
        }

        fn redirecting(set_host: &'static str, status: RemapStatus) -> Arc<Self> {
            Arc::new(Self {
                set_host: Some(set_host),
                redirect: true,
                status,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemapPlugin for ScriptedPlugin {
        fn do_remap(&self, rri: &mut RemapRequestInfo) -> RemapStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(host) = self.set_host {
                rri.request_url.set_host(host);
            }
            if self.redirect {
                rri.redirect = true;
            }
            self.status
        }
    }

    #[derive(Default)]
    struct CompletionRecorder {
        events: Vec<Event>,
    }

    impl Continuation for CompletionRecorder {
        fn handle_event(&mut self, event: Event, _txn: &mut Transaction) {
            self.events.push(event);
        }
    }

    fn txn() -> Transaction {
        let request = RequestHeader::build("GET", b"/x", None).unwrap();
        Transaction::new(request, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
    }

    fn container_with(plugins: Vec<Arc<dyn RemapPlugin>>) -> MappingContainer {
        let mut mapping = UrlMapping::new(
            RewriteUrl::parse_no_path_breakdown("http://a.test/").unwrap(),
            RewriteUrl::parse("http://b.test/").unwrap(),
            1,
        );
        mapping.plugins = plugins;
        MappingContainer::new(Arc::new(mapping))
    }

    fn drive(
        container: &MappingContainer,
        request_url: &mut RewriteUrl,
        txn: &mut Transaction,
        action: Action,
        max_chain: usize,
    ) -> (Vec<Event>, usize, ChainDisposition) {
        let mut recorder = CompletionRecorder::default();
        let mut scheduler = StepScheduler::default();
        let mut chain = PluginChain::new(container, request_url, &mut recorder, action, max_chain);
        let disposition = loop {
            match chain.handle_event(Event::Immediate, txn) {
                ChainDisposition::Reschedule => scheduler.schedule_imm(),
                done => break done,
            }
        };
        (recorder.events, scheduler.scheduled, disposition)
    }

    #[test]
    fn test_no_plugins_applies_default_rewrite() {
        init_log();
        let container = container_with(vec![]);
        let mut url = RewriteUrl::parse("http://a.test/x").unwrap();
        let mut t = txn();

        let (events, scheduled, _) =
            drive(&container, &mut url, &mut t, Action::new(), DEFAULT_MAX_PLUGIN_CHAIN);
        assert_eq!("http://b.test/x", url.to_string());
        assert_eq!(vec![Event::RemapComplete], events);
        assert_eq!(0, scheduled);
    }

    #[test]
    fn test_first_plugin_no_remap_falls_back_to_rule() {
        init_log();
        let plugin = ScriptedPlugin::new(None, RemapStatus::NoRemap);
        let container = container_with(vec![plugin.clone()]);
        let mut url = RewriteUrl::parse("http://a.test/x").unwrap();
        let mut t = txn();

        let (events, _, _) =
            drive(&container, &mut url, &mut t, Action::new(), DEFAULT_MAX_PLUGIN_CHAIN);
        assert_eq!(1, plugin.calls());
        assert_eq!("http://b.test/x", url.to_string());
        assert_eq!(vec![Event::RemapComplete], events);
    }

    #[test]
    fn test_stop_skips_later_plugins() {
        init_log();
        let first = ScriptedPlugin::new(Some("p0.test"), RemapStatus::DidRemap);
        let second = ScriptedPlugin::new(Some("p1.test"), RemapStatus::DidRemapStop);
        let third = ScriptedPlugin::new(Some("p2.test"), RemapStatus::DidRemap);
        let container = container_with(vec![first.clone(), second.clone(), third.clone()]);
        let mut url = RewriteUrl::parse("http://a.test/x").unwrap();
        let mut t = txn();

        let (events, scheduled, _) =
            drive(&container, &mut url, &mut t, Action::new(), DEFAULT_MAX_PLUGIN_CHAIN);
        assert_eq!(1, first.calls());
        assert_eq!(1, second.calls());
        assert_eq!(0, third.calls());
        assert_eq!("p1.test", url.host());
        assert_eq!(vec![Event::RemapComplete], events);
        // Exactly one yield: between plugin 0 and plugin 1.
        assert_eq!(1, scheduled);
    }

    #[test]
    fn test_plugins_observe_prior_mutations_in_order() {
        init_log();
        let first = ScriptedPlugin::new(Some("p0.test"), RemapStatus::DidRemap);
        let second = ScriptedPlugin::new(None, RemapStatus::DidRemap);
        let container = container_with(vec![first, second.clone()]);
        let mut url = RewriteUrl::parse("http://a.test/x").unwrap();
        let mut t = txn();

        drive(&container, &mut url, &mut t, Action::new(), DEFAULT_MAX_PLUGIN_CHAIN);
        // Plugin 1 ran after plugin 0's host change and did not undo it.
        assert_eq!(1, second.calls());
        assert_eq!("p0.test", url.host());
    }

    #[test]
    fn test_redirect_capture_ends_chain() {
        init_log();
        let first = ScriptedPlugin::redirecting("moved.test", RemapStatus::DidRemap);
        let second = ScriptedPlugin::new(Some("p1.test"), RemapStatus::DidRemap);
        let container = container_with(vec![first, second.clone()]);
        let mut url = RewriteUrl::parse("http://a.test/x").unwrap();
        let mut t = txn();

        let (events, _, _) =
            drive(&container, &mut url, &mut t, Action::new(), DEFAULT_MAX_PLUGIN_CHAIN);
        assert_eq!(Some("http://moved.test/x".to_string()), t.remap_redirect);
        assert_eq!(0, second.calls());
        assert_eq!(vec![Event::RemapComplete], events);
    }

    #[test]
    fn test_redirect_ignored_without_did_remap() {
        init_log();
        let plugin = Arc::new(ScriptedPlugin {
            set_host: None,
            redirect: true,
            status: RemapStatus::NoRemap,
            calls: AtomicUsize::new(0),
        });
        let container = container_with(vec![plugin]);
        let mut url = RewriteUrl::parse("http://a.test/x").unwrap();
        let mut t = txn();

        drive(&container, &mut url, &mut t, Action::new(), DEFAULT_MAX_PLUGIN_CHAIN);
        assert_eq!(None, t.remap_redirect);
    }

    #[test]
    fn test_cancellation_between_schedulings() {
        init_log();
        let first = ScriptedPlugin::new(Some("p0.test"), RemapStatus::DidRemap);
        let second = ScriptedPlugin::new(Some("p1.test"), RemapStatus::DidRemap);
        let container = container_with(vec![first.clone(), second.clone()]);
        let mut url = RewriteUrl::parse("http://a.test/x").unwrap();
        let mut t = txn();

        let action = Action::new();
        let mut recorder = CompletionRecorder::default();
        let mut chain = PluginChain::new(
            &container,
            &mut url,
            &mut recorder,
            action.clone(),
            DEFAULT_MAX_PLUGIN_CHAIN,
        );

        assert_eq!(ChainDisposition::Reschedule, chain.handle_event(Event::Immediate, &mut t));
        action.cancel();
        assert_eq!(ChainDisposition::Cancelled, chain.handle_event(Event::Immediate, &mut t));

        assert_eq!(1, first.calls());
        assert_eq!(0, second.calls());
        assert!(recorder.events.is_empty());
    }

    #[test]
    fn test_chain_cap_forces_finish() {
        init_log();
        let scripted: Vec<Arc<ScriptedPlugin>> = (0..6)
            .map(|_| ScriptedPlugin::new(None, RemapStatus::DidRemap))
            .collect();
        let plugins: Vec<Arc<dyn RemapPlugin>> = scripted
            .iter()
            .map(|p| p.clone() as Arc<dyn RemapPlugin>)
            .collect();
        let container = container_with(plugins);
        let mut url = RewriteUrl::parse("http://a.test/x").unwrap();
        let mut t = txn();

        let (events, _, _) = drive(&container, &mut url, &mut t, Action::new(), 3);
        assert_eq!(vec![Event::RemapComplete], events);
        // The guard trips once the cursor passes the cap; the tail of the
        // chain is never invoked.
        assert_eq!(0, scripted[4].calls());
        assert_eq!(0, scripted[5].calls());
    }
}
