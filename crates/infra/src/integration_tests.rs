//! Integration tests for the job-driven pipelines.
//!
//! Tests: producer -> JobStore -> JobExecutor -> handler -> stores
//!
//! Verifies:
//! - Automation trees run end to end and branch per contact
//! - Fan-out pages cover every contact, including exact page multiples
//! - Re-delivered jobs do not repeat side effects
//! - AB broadcasts split, pick a winner and send the final sample

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use mailpulse_automations::{
        subtype, Automation, AutomationStep, StepType, BRANCH_DEFAULT, BRANCH_ELSE, BRANCH_THEN,
    };
    use mailpulse_broadcasts::{AbTestVariant, Broadcast, BroadcastStatus, EmailContent};
    use mailpulse_core::{AudienceId, Contact, ContactId, TagId};

    use crate::automation::{
        self, ActivationError, AutomationEngine, AutomationSettings, EnrollAudience, FanOutStep, RunWorkflow,
        RunnerRegistry,
    };
    use crate::broadcast::{self, BroadcastScheduler, BroadcastSettings};
    use crate::jobs::{
        InMemoryJobStore, JobExecutor, JobExecutorConfig, JobRegistry, JobStats, JobStore,
        JobTypeOptions,
    };
    use crate::mail::RecordingMailSender;
    use crate::store::{AutomationStore, BroadcastStore, ContactStore, InMemoryMarketingStore, Stores};

    struct Harness {
        store: Arc<InMemoryMarketingStore>,
        engine: Arc<AutomationEngine>,
        jobs: Arc<InMemoryJobStore>,
        mail: Arc<RecordingMailSender>,
        scheduler: Arc<BroadcastScheduler>,
        executor: JobExecutor,
    }

    fn harness(page_size: usize, batch_size: usize) -> Harness {
        let store = Arc::new(InMemoryMarketingStore::new());
        let jobs = InMemoryJobStore::arc();
        let mail = Arc::new(RecordingMailSender::new());
        let stores = Stores::shared(store.clone());

        let engine = Arc::new(AutomationEngine::new(
            stores.clone(),
            jobs.clone(),
            mail.clone(),
            RunnerRegistry::with_builtins(),
            AutomationSettings { page_size },
        ));
        let scheduler = Arc::new(BroadcastScheduler::new(
            stores,
            jobs.clone(),
            mail.clone(),
            BroadcastSettings {
                batch_size,
                ..BroadcastSettings::default()
            },
        ));

        let mut registry = JobRegistry::new();
        automation::register(&mut registry, engine.clone(), JobTypeOptions::default());
        broadcast::register(&mut registry, scheduler.clone(), JobTypeOptions::default());

        let executor = JobExecutor::new(
            jobs.clone(),
            Arc::new(registry),
            JobExecutorConfig::default()
                .with_queues([automation::QUEUE, broadcast::QUEUE])
                .with_concurrency(50),
        );

        Harness {
            store,
            engine,
            jobs,
            mail,
            scheduler,
            executor,
        }
    }

    impl Harness {
        async fn drain(&self) {
            self.executor.drain(1_000).await.unwrap();
        }

        async fn stats(&self, queue: &str) -> JobStats {
            self.jobs.stats(queue, crate::jobs::types::now()).await.unwrap()
        }

        fn contacts(&self, audience: AudienceId, n: usize) -> Vec<Contact> {
            (0..n)
                .map(|i| {
                    let contact = Contact::new(audience, format!("c{i}@acme.io"));
                    self.store.insert_contact(contact.clone()).unwrap();
                    contact
                })
                .collect()
        }
    }

    fn step(automation: &Automation, step_type: StepType, subtype: &str, config: serde_json::Value) -> AutomationStep {
        AutomationStep::new(automation.id, step_type, subtype, config)
    }

    fn welcome_email() -> serde_json::Value {
        json!({"from": "hi@acme.io", "subject": "Welcome", "html": "<p>welcome</p>"})
    }

    #[tokio::test]
    async fn automation_branches_each_contact_through_the_tree() {
        let h = harness(75, 500);
        let audience = AudienceId::new();
        let automation = Automation::new(audience, "onboarding");
        let vip = TagId::new();

        // trigger -> if plan == pro
        //              then: add tag -> send email
        //              else: end
        let trigger = step(&automation, StepType::Trigger, subtype::TRIGGER_SEGMENT, json!({}));
        let rule = step(
            &automation,
            StepType::Rule,
            subtype::RULE_IF_ELSE,
            json!({"filter": {"type": "AND", "groups": [{"type": "AND", "conditions": [
                {"field": "attributes.plan", "operation": "eq", "value": "pro"}
            ]}]}}),
        )
        .child_of(&trigger, BRANCH_DEFAULT);
        let tag = step(&automation, StepType::Action, subtype::ACTION_ADD_TAG, json!({"tagId": vip}))
            .child_of(&rule, BRANCH_THEN);
        let send = step(&automation, StepType::Action, subtype::ACTION_SEND_EMAIL, welcome_email())
            .child_of(&tag, BRANCH_DEFAULT);
        let end = step(&automation, StepType::End, subtype::END, serde_json::Value::Null)
            .child_of(&rule, BRANCH_ELSE);

        h.store.insert_automation(automation.clone()).unwrap();
        h.store
            .insert_steps([trigger.clone(), rule.clone(), tag.clone(), send.clone(), end.clone()])
            .unwrap();

        let pro = Contact::new(audience, "pro@acme.io").with_attribute("plan", "pro");
        let free = Contact::new(audience, "free@acme.io").with_attribute("plan", "free");
        let outsider = Contact::new(AudienceId::new(), "other@acme.io").with_attribute("plan", "pro");
        for c in [&pro, &free, &outsider] {
            h.store.insert_contact(c.clone()).unwrap();
        }

        h.jobs
            .dispatch(EnrollAudience { automation_id: automation.id }.job().unwrap())
            .await
            .unwrap();
        h.drain().await;

        assert_eq!(h.store.completed_at(trigger.id).unwrap().len(), 2);
        assert_eq!(h.store.completed_at(send.id).unwrap(), vec![pro.id]);
        assert_eq!(h.store.completed_at(end.id).unwrap(), vec![free.id]);

        let stored = h.store.get_contact(pro.id).await.unwrap().unwrap();
        assert!(stored.has_tag(&vip));
        let stored = h.store.get_contact(free.id).await.unwrap().unwrap();
        assert!(!stored.has_tag(&vip));

        assert_eq!(h.mail.sent_to("pro@acme.io"), 1);
        assert_eq!(h.mail.sent().len(), 1);

        let stats = h.stats(automation::QUEUE).await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dead_lettered, 0);
    }

    #[tokio::test]
    async fn fan_out_reaches_every_contact_at_exact_page_multiples() {
        let h = harness(75, 500);
        let audience = AudienceId::new();
        let automation = Automation::new(audience, "backfill");
        let trigger = step(&automation, StepType::Trigger, subtype::TRIGGER_SEGMENT, json!({}));
        let tag = step(
            &automation,
            StepType::Action,
            subtype::ACTION_ADD_TAG,
            json!({"tagId": TagId::new()}),
        )
        .child_of(&trigger, BRANCH_DEFAULT);
        h.store.insert_automation(automation.clone()).unwrap();
        h.store.insert_steps([trigger.clone(), tag.clone()]).unwrap();

        // 150 contacts completed the trigger before the action step existed.
        let contacts = h.contacts(audience, 150);
        for c in &contacts {
            assert!(h
                .store
                .record_completion(c.id, trigger.id, Some(BRANCH_DEFAULT))
                .await
                .unwrap());
        }

        h.jobs
            .dispatch(FanOutStep { step_id: tag.id }.job().unwrap())
            .await
            .unwrap();
        h.drain().await;

        let mut expected: Vec<ContactId> = contacts.iter().map(|c| c.id).collect();
        expected.sort();
        assert_eq!(h.store.completed_at(tag.id).unwrap(), expected);

        // A second fan-out finds nothing left to do.
        let before = h.stats(automation::QUEUE).await.completed;
        h.jobs
            .dispatch(FanOutStep { step_id: tag.id }.job().unwrap())
            .await
            .unwrap();
        h.drain().await;
        assert_eq!(h.stats(automation::QUEUE).await.completed, before + 1);
    }

    fn pro_plan_rule(automation: &Automation, parent: &AutomationStep) -> AutomationStep {
        step(
            automation,
            StepType::Rule,
            subtype::RULE_IF_ELSE,
            json!({"filter": {"type": "AND", "groups": [{"type": "AND", "conditions": [
                {"field": "attributes.plan", "operation": "eq", "value": "pro"}
            ]}]}}),
        )
        .child_of(parent, BRANCH_DEFAULT)
    }

    #[tokio::test]
    async fn fan_out_below_a_rule_only_reaches_its_own_branch() {
        let h = harness(75, 500);
        let audience = AudienceId::new();
        let automation = Automation::new(audience, "upsell");
        let trigger = step(&automation, StepType::Trigger, subtype::TRIGGER_SEGMENT, json!({}));
        let rule = pro_plan_rule(&automation, &trigger);
        let end = step(&automation, StepType::End, subtype::END, serde_json::Value::Null)
            .child_of(&rule, BRANCH_ELSE);
        h.store.insert_automation(automation.clone()).unwrap();
        h.store
            .insert_steps([trigger.clone(), rule.clone(), end.clone()])
            .unwrap();

        let pro = Contact::new(audience, "pro@acme.io").with_attribute("plan", "pro");
        let free = Contact::new(audience, "free@acme.io").with_attribute("plan", "free");
        for c in [&pro, &free] {
            h.store.insert_contact(c.clone()).unwrap();
        }
        h.jobs
            .dispatch(EnrollAudience { automation_id: automation.id }.job().unwrap())
            .await
            .unwrap();
        h.drain().await;
        assert_eq!(h.store.completed_at(rule.id).unwrap().len(), 2);
        assert_eq!(h.store.completed_at(end.id).unwrap(), vec![free.id]);

        // The THEN branch gets its first step after both contacts passed the rule.
        let vip = TagId::new();
        let tag = step(&automation, StepType::Action, subtype::ACTION_ADD_TAG, json!({"tagId": vip}))
            .child_of(&rule, BRANCH_THEN);
        h.store.insert_steps([tag.clone()]).unwrap();
        h.jobs
            .dispatch(FanOutStep { step_id: tag.id }.job().unwrap())
            .await
            .unwrap();
        h.drain().await;

        assert_eq!(h.store.completed_at(tag.id).unwrap(), vec![pro.id]);
        let stored = h.store.get_contact(free.id).await.unwrap().unwrap();
        assert!(!stored.has_tag(&vip));
        let stored = h.store.get_contact(pro.id).await.unwrap().unwrap();
        assert!(stored.has_tag(&vip));
    }

    #[tokio::test]
    async fn activate_rejects_broken_automations_before_enqueueing() {
        let h = harness(75, 500);
        let audience = AudienceId::new();

        let unsupported = Automation::new(audience, "unsupported rule");
        let trigger = step(&unsupported, StepType::Trigger, subtype::TRIGGER_SEGMENT, json!({}));
        let rule = step(
            &unsupported,
            StepType::Rule,
            subtype::RULE_IF_ELSE,
            json!({"filter": {"type": "AND", "groups": [{"type": "AND", "conditions": [
                {"field": "email", "operation": "contains", "value": "acme"}
            ]}]}}),
        )
        .child_of(&trigger, BRANCH_DEFAULT);
        h.store.insert_automation(unsupported.clone()).unwrap();
        h.store.insert_steps([trigger, rule.clone()]).unwrap();
        let err = h.engine.activate(unsupported.id).await.unwrap_err();
        assert!(matches!(err, ActivationError::InvalidStep { step, .. } if step == rule.id));

        let headless = Automation::new(audience, "no trigger");
        h.store.insert_automation(headless.clone()).unwrap();
        let err = h.engine.activate(headless.id).await.unwrap_err();
        assert!(matches!(
            err,
            ActivationError::Tree(mailpulse_automations::TreeError::MissingTrigger)
        ));

        let webhook = Automation::new(audience, "unknown subtype");
        let trigger = step(&webhook, StepType::Trigger, subtype::TRIGGER_SEGMENT, json!({}));
        let call = step(&webhook, StepType::Action, "ACTION_WEBHOOK", json!({}))
            .child_of(&trigger, BRANCH_DEFAULT);
        h.store.insert_automation(webhook.clone()).unwrap();
        h.store.insert_steps([trigger, call]).unwrap();
        let err = h.engine.activate(webhook.id).await.unwrap_err();
        assert!(matches!(err, ActivationError::UnknownSubtype { ref subtype, .. } if subtype == "ACTION_WEBHOOK"));

        let paused = Automation::new(audience, "paused").inactive();
        h.store.insert_automation(paused.clone()).unwrap();
        assert!(matches!(
            h.engine.activate(paused.id).await.unwrap_err(),
            ActivationError::Inactive(_)
        ));

        assert_eq!(h.stats(automation::QUEUE).await.pending, 0);
    }

    #[tokio::test]
    async fn activate_enrolls_the_audience() {
        let h = harness(75, 500);
        let audience = AudienceId::new();
        let automation = Automation::new(audience, "welcome");
        let trigger = step(&automation, StepType::Trigger, subtype::TRIGGER_SEGMENT, json!({}));
        let rule = pro_plan_rule(&automation, &trigger);
        let send = step(&automation, StepType::Action, subtype::ACTION_SEND_EMAIL, welcome_email())
            .child_of(&rule, BRANCH_THEN);
        h.store.insert_automation(automation.clone()).unwrap();
        h.store.insert_steps([trigger, rule, send.clone()]).unwrap();
        let pro = Contact::new(audience, "pro@acme.io").with_attribute("plan", "pro");
        h.store.insert_contact(pro.clone()).unwrap();
        h.contacts(audience, 3);

        let job_id = h.engine.activate(automation.id).await.unwrap();
        let job = h.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.job_type, automation::ENROLL_AUDIENCE);
        h.drain().await;

        assert_eq!(h.store.completed_at(send.id).unwrap(), vec![pro.id]);
        assert_eq!(h.mail.sent().len(), 1);
    }

    #[tokio::test]
    async fn redelivered_workflow_jobs_send_once() {
        let h = harness(75, 500);
        let audience = AudienceId::new();
        let automation = Automation::new(audience, "welcome");
        let trigger = step(&automation, StepType::Trigger, subtype::TRIGGER_SEGMENT, json!({}));
        let send = step(&automation, StepType::Action, subtype::ACTION_SEND_EMAIL, welcome_email())
            .child_of(&trigger, BRANCH_DEFAULT);
        h.store.insert_automation(automation.clone()).unwrap();
        h.store.insert_steps([trigger.clone(), send.clone()]).unwrap();
        let contact = h.contacts(audience, 1).remove(0);

        let job = RunWorkflow {
            automation_id: automation.id,
            contact_id: contact.id,
        }
        .job()
        .unwrap();
        h.jobs.dispatch_many(vec![job.clone(), job.clone(), job]).await.unwrap();
        h.drain().await;

        assert_eq!(h.mail.sent_to(&contact.email), 1);
        assert_eq!(h.store.completed_at(send.id).unwrap(), vec![contact.id]);

        // Running again later is a no-op as well.
        h.jobs
            .dispatch(
                RunWorkflow {
                    automation_id: automation.id,
                    contact_id: contact.id,
                }
                .job()
                .unwrap(),
            )
            .await
            .unwrap();
        h.drain().await;
        assert_eq!(h.mail.sent_to(&contact.email), 1);
    }

    #[tokio::test]
    async fn wait_step_delays_the_next_step() {
        let h = harness(75, 500);
        let audience = AudienceId::new();
        let automation = Automation::new(audience, "nurture");
        let trigger = step(&automation, StepType::Trigger, subtype::TRIGGER_SEGMENT, json!({}));
        let wait = step(&automation, StepType::Rule, subtype::RULE_WAIT, json!({"seconds": 86_400}))
            .child_of(&trigger, BRANCH_DEFAULT);
        let send = step(&automation, StepType::Action, subtype::ACTION_SEND_EMAIL, welcome_email())
            .child_of(&wait, BRANCH_DEFAULT);
        h.store.insert_automation(automation.clone()).unwrap();
        h.store.insert_steps([trigger, wait.clone(), send.clone()]).unwrap();
        let contact = h.contacts(audience, 1).remove(0);

        h.jobs
            .dispatch(
                RunWorkflow {
                    automation_id: automation.id,
                    contact_id: contact.id,
                }
                .job()
                .unwrap(),
            )
            .await
            .unwrap();
        h.drain().await;

        assert_eq!(h.store.completed_at(wait.id).unwrap(), vec![contact.id]);
        assert!(h.mail.sent().is_empty());
        assert_eq!(h.stats(automation::QUEUE).await.pending, 1);

        assert_eq!(h.jobs.make_due(automation::RUN_STEP).unwrap(), 1);
        h.drain().await;
        assert_eq!(h.mail.sent_to(&contact.email), 1);
        assert_eq!(h.store.completed_at(send.id).unwrap(), vec![contact.id]);
    }

    #[tokio::test]
    async fn ab_broadcast_splits_picks_winner_and_sends_final_sample() {
        let h = harness(75, 500);
        let audience = AudienceId::new();
        h.contacts(audience, 1000);

        let broadcast = Broadcast::new(audience, EmailContent::new("news@acme.io", "Launch", "<p>x</p>"))
            .ab_test(4);
        let id = broadcast.id;
        let a = AbTestVariant::new(id, 20, 0, EmailContent::new("news@acme.io", "Subject A", "<p>a</p>"));
        let b = AbTestVariant::new(id, 30, 1, EmailContent::new("news@acme.io", "Subject B", "<p>b</p>"));
        h.store.insert_broadcast(broadcast).unwrap();
        h.store.insert_variant(a.clone()).unwrap();
        h.store.insert_variant(b.clone()).unwrap();

        h.scheduler.queue(id).await.unwrap();
        h.drain().await;

        let subjects = |s: &str| h.mail.sent().iter().filter(|m| m.subject == s).count();
        assert_eq!(subjects("Subject A"), 200);
        assert_eq!(subjects("Subject B"), 300);
        let stored = h.store.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::Sending);
        assert_eq!(stored.planned_recipients, Some(1000));

        // The final sample fires early: no winner yet, so it waits and sends nothing.
        assert_eq!(h.jobs.make_due(broadcast::SEND_FINAL_SAMPLE).unwrap(), 1);
        h.drain().await;
        assert_eq!(h.mail.sent().len(), 500);

        // B opens at 20%, A at 5%.
        let deliveries = h.store.deliveries(id).unwrap();
        let opened_a = deliveries.iter().filter(|d| d.variant_id == Some(a.id)).take(10);
        let opened_b = deliveries.iter().filter(|d| d.variant_id == Some(b.id)).take(60);
        for d in opened_a.chain(opened_b) {
            h.store.mark_opened(id, d.contact_id).unwrap();
        }

        assert_eq!(h.jobs.make_due(broadcast::PICK_WINNER).unwrap(), 1);
        h.drain().await;
        let stored = h.store.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.winning_variant_id, Some(b.id));

        assert_eq!(h.jobs.make_due(broadcast::SEND_FINAL_SAMPLE).unwrap(), 1);
        h.drain().await;

        assert_eq!(subjects("Subject A"), 200);
        assert_eq!(subjects("Subject B"), 800);
        assert_eq!(h.store.deliveries(id).unwrap().len(), 1000);
        let stored = h.store.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::Sent);
        assert_eq!(h.stats(broadcast::QUEUE).await.dead_lettered, 0);
    }

    #[tokio::test]
    async fn broadcast_with_no_recipients_is_sent_immediately() {
        let h = harness(75, 500);
        let broadcast = Broadcast::new(AudienceId::new(), EmailContent::new("news@acme.io", "Hi", "<p>hi</p>"))
            .ab_test(1);
        let id = broadcast.id;
        h.store.insert_broadcast(broadcast).unwrap();
        h.store
            .insert_variant(AbTestVariant::new(id, 50, 0, EmailContent::new("a@acme.io", "A", "a")))
            .unwrap();
        h.store
            .insert_variant(AbTestVariant::new(id, 50, 1, EmailContent::new("b@acme.io", "B", "b")))
            .unwrap();

        h.scheduler.queue(id).await.unwrap();
        h.drain().await;

        let stored = h.store.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::Sent);
        assert_eq!(stored.planned_recipients, Some(0));
        assert!(h.mail.sent().is_empty());
        let stats = h.stats(broadcast::QUEUE).await;
        assert_eq!((stats.pending, stats.completed), (0, 1));
    }

    #[tokio::test]
    async fn contacts_leaving_mid_send_are_skipped_and_the_broadcast_completes() {
        let h = harness(75, 2);
        let audience = AudienceId::new();
        let contacts = h.contacts(audience, 4);
        let broadcast = Broadcast::new(audience, EmailContent::new("news@acme.io", "Hi", "<p>hi</p>"));
        let id = broadcast.id;
        h.store.insert_broadcast(broadcast).unwrap();
        h.scheduler.queue(id).await.unwrap();

        // First cycle runs only the schedule job.
        assert_eq!(h.executor.run_cycle().await.unwrap(), 1);
        let mut leaving = contacts[0].clone();
        leaving.subscribed = false;
        h.store.insert_contact(leaving.clone()).unwrap();
        h.drain().await;

        assert_eq!(h.mail.sent().len(), 3);
        assert_eq!(h.mail.sent_to(&leaving.email), 0);
        let deliveries = h.store.deliveries(id).unwrap();
        assert_eq!(deliveries.len(), 4);
        assert_eq!(deliveries.iter().filter(|d| !d.is_sent()).count(), 1);
        assert_eq!(
            h.store.get_broadcast(id).await.unwrap().unwrap().status,
            BroadcastStatus::Sent
        );
    }

    #[tokio::test]
    async fn spawned_executor_drains_and_shuts_down() {
        let h = harness(75, 500);
        let audience = AudienceId::new();
        h.contacts(audience, 3);
        let broadcast = Broadcast::new(audience, EmailContent::new("news@acme.io", "Hi", "<p>hi</p>"));
        let id = broadcast.id;
        h.store.insert_broadcast(broadcast).unwrap();
        h.scheduler.queue(id).await.unwrap();

        let handle = JobExecutor::new(
            h.jobs.clone(),
            Arc::new({
                let mut registry = JobRegistry::new();
                broadcast::register(&mut registry, h.scheduler.clone(), JobTypeOptions::default());
                registry
            }),
            JobExecutorConfig::default()
                .with_queues([broadcast::QUEUE])
                .with_poll_interval(Duration::from_millis(10)),
        )
        .spawn();

        let mut status = BroadcastStatus::Queued;
        for _ in 0..200 {
            status = h.store.get_broadcast(id).await.unwrap().unwrap().status;
            if status == BroadcastStatus::Sent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.shutdown().await;

        assert_eq!(status, BroadcastStatus::Sent);
        assert_eq!(h.mail.sent().len(), 3);
        // The schedule job and its single batch, both recorded before shutdown returns.
        assert_eq!(stats.jobs_succeeded, 2);
    }
}
