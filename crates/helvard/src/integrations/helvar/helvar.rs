use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::HelvarConfig;
use super::light::HelvarLight;
use super::light::LightError;
use super::router::Router;
use super::router::RouterSession;
use super::subscription::RepaintReceiver;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::SetupError;
use crate::engine::ToIntegrationMessage;

type LightsMap = Arc<BTreeMap<String, Arc<HelvarLight>>>;

/// One configured Helvar router, exposed as light entities.
///
/// Owns the [`RouterSession`] for its entry. Every group on the router
/// becomes a scene-switched light and every DALI lamp device a dimmable one.
pub struct HelvarIntegration<R: Router> {
    name: String,
    entry_id: String,
    config: HelvarConfig,
    session: RouterSession<R>,
    lights: LightsMap,
    to_engine: Option<FromIntegrationSender>,
    /// Handle to the background repaint task
    repaint_task: Option<JoinHandle<()>>,
}

impl<R: Router> HelvarIntegration<R> {
    pub fn new(entry_id: &str, config: &HelvarConfig, port: u16, router: R) -> Self {
        Self {
            name: format!("helvar.{}", entry_id),
            entry_id: entry_id.to_string(),
            config: config.clone(),
            session: RouterSession::new(config.host.clone(), port, router),
            lights: Arc::default(),
            to_engine: None,
            repaint_task: None,
        }
    }

    fn build_lights(&self, router: &R) -> Result<BTreeMap<String, Arc<HelvarLight>>, SetupError> {
        let failed = |e: LightError| SetupError::Failed(Box::new(e));
        let mut lights = BTreeMap::new();

        for group in router.groups() {
            let light = HelvarLight::new(&self.entry_id, Some(group), None, self.config.scenes)
                .map_err(failed)?;
            lights.insert(light.entity_id().to_string(), Arc::new(light));
        }
        for device in router.light_devices() {
            let light = HelvarLight::new(&self.entry_id, None, Some(device), self.config.scenes)
                .map_err(failed)?;
            lights.insert(light.entity_id().to_string(), Arc::new(light));
        }

        Ok(lights)
    }

    /// Re-read every light named on the repaint channel and report it.
    async fn repaint_task(
        lights: LightsMap,
        mut repaint: RepaintReceiver,
        to_engine: FromIntegrationSender,
    ) {
        while let Some(entity_id) = repaint.recv().await {
            let Some(light) = lights.get(&entity_id) else {
                debug!("Repaint for unknown light {}", entity_id);
                continue;
            };
            Self::report_state(light, &to_engine).await;
        }
    }

    async fn report_state(light: &HelvarLight, to_engine: &FromIntegrationSender) {
        if let Err(e) = light.update().await {
            warn!("Failed to update {}: {}", light.entity_id(), e);
            return;
        }
        let state = light.state();
        let msg = FromIntegrationMessage::LightStateChanged {
            entity_id: light.entity_id().to_string(),
            name: state.name,
            on: state.on,
            brightness: state.brightness,
        };
        if let Err(e) = to_engine.send(msg).await {
            warn!("Failed to send LightStateChanged message: {}", e);
        }
    }
}

#[async_trait]
impl<R: Router> Integration for HelvarIntegration<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), SetupError> {
        self.session
            .connect_and_initialize()
            .await
            .map_err(|e| -> SetupError {
                if e.is_retryable() {
                    SetupError::NotReady(Box::new(e))
                } else {
                    SetupError::Failed(Box::new(e))
                }
            })?;

        let router = self
            .session
            .api()
            .cloned()
            .ok_or_else(|| SetupError::Failed("router session is not ready".into()))?;
        let lights: LightsMap = Arc::new(self.build_lights(&router)?);

        for entity_id in lights.keys() {
            let msg = FromIntegrationMessage::EntityDiscovered {
                entity_id: entity_id.clone(),
                integration_name: self.name.clone(),
            };
            if let Err(e) = tx.send(msg).await {
                warn!("Failed to send EntityDiscovered message: {}", e);
            }
        }

        let (repaint_tx, repaint_rx) = mpsc::unbounded_channel();
        for light in lights.values() {
            light.register_subscription(repaint_tx.clone());
            Self::report_state(light, &tx).await;
        }

        self.repaint_task = Some(tokio::spawn(Self::repaint_task(
            lights.clone(),
            repaint_rx,
            tx.clone(),
        )));

        info!(
            "Helvar integration {} ready with {} lights from {}:{}",
            self.entry_id,
            lights.len(),
            self.session.host(),
            self.session.port()
        );
        self.lights = lights;
        self.to_engine = Some(tx);
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        match msg {
            ToIntegrationMessage::LightCommand { entity_id, on } => {
                info!("Handling light command for {}: on={}", entity_id, on);
                if !self.session.is_available() {
                    return Err(Box::new(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        format!("Helvar router at {} is unavailable", self.session.host()),
                    )));
                }
                let light = self
                    .lights
                    .get(&entity_id)
                    .ok_or_else(|| -> Box<dyn Error + Send> {
                        Box::new(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("Light not found: {}", entity_id),
                        ))
                    })?;

                let result = if on {
                    light.turn_on().await
                } else {
                    light.turn_off().await
                };
                result.map_err(|e| -> Box<dyn Error + Send> { Box::new(e) })?;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        info!("Helvar integration {} shutting down", self.entry_id);

        for light in self.lights.values() {
            light.release_subscription();
        }
        if let Some(task) = self.repaint_task.take() {
            task.abort();
        }

        if let Some(tx) = &self.to_engine {
            for entity_id in self.lights.keys() {
                let msg = FromIntegrationMessage::EntityRemoved {
                    entity_id: entity_id.clone(),
                };
                if let Err(e) = tx.send(msg).await {
                    warn!("Failed to send EntityRemoved message: {}", e);
                }
            }
        }
        self.lights = Arc::default();

        self.session.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::engine::FromIntegrationMessage::*;
    use crate::integrations::helvar::address::DeviceAddress;
    use crate::integrations::helvar::address::SceneAddress;
    use crate::integrations::helvar::address::SceneMapping;
    use crate::integrations::helvar::router::RouterError;
    use crate::integrations::helvar::router::SessionState;
    use crate::integrations::helvar::router::mock::MockCall;
    use crate::integrations::helvar::router::mock::MockRouter;
    use crate::integrations::helvar::router::mock::refused;
    use crate::integrations::helvar::subscription::SubscriptionKey;

    fn config() -> HelvarConfig {
        HelvarConfig {
            host: "10.254.1.1".to_string(),
            enabled: true,
            scenes: SceneMapping::default(),
            poll_interval_secs: 30,
        }
    }

    fn lamp() -> DeviceAddress {
        DeviceAddress::new(1, 1, 2, 9)
    }

    fn integration(router: MockRouter) -> HelvarIntegration<MockRouter> {
        HelvarIntegration::new("office", &config(), 50000, router)
    }

    fn router() -> MockRouter {
        MockRouter::new()
            .with_group(4, "Lobby")
            .with_device(lamp(), "Desk Lamp")
    }

    fn drain(rx: &mut mpsc::Receiver<FromIntegrationMessage>) -> Vec<FromIntegrationMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    fn mock(integration: &HelvarIntegration<MockRouter>) -> &MockRouter {
        integration.session.api().unwrap()
    }

    #[tokio::test]
    async fn test_setup_reports_lights() {
        let mut integration = integration(router());
        let (tx, mut rx) = mpsc::channel(64);

        integration.setup(tx).await.unwrap();

        assert_eq!(integration.name(), "helvar.office");
        assert_eq!(
            drain(&mut rx),
            vec![
                EntityDiscovered {
                    entity_id: "light.office_1_1_2_9".to_string(),
                    integration_name: "helvar.office".to_string(),
                },
                EntityDiscovered {
                    entity_id: "light.office_group_4".to_string(),
                    integration_name: "helvar.office".to_string(),
                },
                LightStateChanged {
                    entity_id: "light.office_1_1_2_9".to_string(),
                    name: "Desk Lamp".to_string(),
                    on: false,
                    brightness: Some(0),
                },
                LightStateChanged {
                    entity_id: "light.office_group_4".to_string(),
                    name: "Group: Lobby".to_string(),
                    on: false,
                    brightness: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_router_is_not_ready() {
        let mut integration = integration(router().fail_connect(refused()));
        let (tx, mut rx) = mpsc::channel(64);

        let err = integration.setup(tx.clone()).await.unwrap_err();
        assert!(matches!(err, SetupError::NotReady(_)));
        assert_eq!(
            integration.session.state(),
            SessionState::Failed(crate::integrations::helvar::router::FailureKind::Retryable)
        );
        assert!(drain(&mut rx).is_empty());

        // The engine retries; the second attempt connects.
        integration.setup(tx).await.unwrap();
        assert_eq!(mock(&integration).connect_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[tokio::test]
    async fn test_other_errors_fail_setup() {
        let mut integration = integration(
            router().fail_initialize(RouterError::Timeout(">V:2,C:165#".to_string())),
        );
        let (tx, _rx) = mpsc::channel(64);

        let err = integration.setup(tx).await.unwrap_err();
        assert!(matches!(err, SetupError::Failed(_)));
    }

    #[tokio::test]
    async fn test_commands_drive_router() {
        let mut integration = integration(router());
        let (tx, _rx) = mpsc::channel(64);
        integration.setup(tx).await.unwrap();

        integration
            .handle_message(ToIntegrationMessage::LightCommand {
                entity_id: "light.office_group_4".to_string(),
                on: true,
            })
            .await
            .unwrap();
        integration
            .handle_message(ToIntegrationMessage::LightCommand {
                entity_id: "light.office_1_1_2_9".to_string(),
                on: false,
            })
            .await
            .unwrap();

        assert_eq!(
            mock(&integration).calls(),
            vec![
                MockCall::SetScene(SceneAddress::new(4, 1, 1)),
                MockCall::SetBrightness(lamp(), 0),
            ]
        );

        let err = integration
            .handle_message(ToIntegrationMessage::LightCommand {
                entity_id: "light.office_group_99".to_string(),
                on: true,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("light.office_group_99"));
    }

    #[tokio::test]
    async fn test_failed_command_is_reported() {
        let mut integration = integration(router());
        let (tx, _rx) = mpsc::channel(64);
        integration.setup(tx).await.unwrap();
        mock(&integration).groups[0]
            .fail_commands
            .store(true, Ordering::SeqCst);

        let err = integration
            .handle_message(ToIntegrationMessage::LightCommand {
                entity_id: "light.office_group_4".to_string(),
                on: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "router is not connected");
    }

    #[tokio::test]
    async fn test_router_changes_repaint_lights() {
        let mut integration = integration(router());
        let (tx, mut rx) = mpsc::channel(64);
        integration.setup(tx).await.unwrap();
        drain(&mut rx);

        mock(&integration).groups[0].report_scene(Some(SceneAddress::new(4, 2, 1)));
        assert_eq!(
            rx.recv().await.unwrap(),
            LightStateChanged {
                entity_id: "light.office_group_4".to_string(),
                name: "Group: Lobby".to_string(),
                on: true,
                brightness: None,
            }
        );

        mock(&integration).devices[0].report_brightness(77);
        assert_eq!(
            rx.recv().await.unwrap(),
            LightStateChanged {
                entity_id: "light.office_1_1_2_9".to_string(),
                name: "Desk Lamp".to_string(),
                on: true,
                brightness: Some(77),
            }
        );

        // Recalling the off scene reads as off.
        mock(&integration).groups[0].report_scene(Some(SceneAddress::new(4, 1, 16)));
        assert!(matches!(
            rx.recv().await.unwrap(),
            LightStateChanged { on: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let mut integration = integration(router());
        let (tx, mut rx) = mpsc::channel(64);
        integration.setup(tx).await.unwrap();
        drain(&mut rx);

        let router = integration.session.api().unwrap().clone();
        assert_eq!(router.registry.subscriber_count(SubscriptionKey::Group(4)), 1);

        integration.shutdown().await.unwrap();

        assert_eq!(router.registry.subscriber_count(SubscriptionKey::Group(4)), 0);
        assert_eq!(
            router
                .registry
                .subscriber_count(SubscriptionKey::Device(lamp())),
            0
        );
        assert_eq!(router.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(integration.session.state(), SessionState::Uninitialized);
        assert_eq!(
            drain(&mut rx),
            vec![
                EntityRemoved {
                    entity_id: "light.office_1_1_2_9".to_string(),
                },
                EntityRemoved {
                    entity_id: "light.office_group_4".to_string(),
                },
            ]
        );
    }
}
