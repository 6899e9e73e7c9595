use std::{
    error::Error,
    path::PathBuf,
    time::{Duration, Instant},
};

use rumqttc::AsyncClient;
use tablelink_core::{
    config::Config,
    sample::{LatestSampleSlot, SampleBuffer, SamplePipeline, MAX_RAW},
    Board, Node, Timestamp,
};

use crate::{
    console::Command,
    converter::{AnalogInput, EmulatedDma},
    mqtt::MqttTransport,
};

mod console;
mod converter;
mod mqtt;

static SAMPLES: SampleBuffer = SampleBuffer::new();
static LATEST: LatestSampleSlot = LatestSampleSlot::new();

struct HostBoard {
    boot: Instant,
}

impl HostBoard {
    fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Board for HostBoard {
    fn uptime(&self) -> Timestamp {
        let millis = self.boot.elapsed().as_millis();
        Timestamp::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    fn set_led(&mut self, on: bool) {
        log::info!("LED {}", if on { "on" } else { "off" });
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;
    if let Ok(broker) = std::env::var("MQTT") {
        config.broker = broker;
    }

    let device_id = config.device_id(&host_name())?;
    let node_config = config.node_config(device_id.clone());
    let namespace = node_config.namespace();
    log::info!("Starting node '{device_id}'");

    // Start sampling before anything can ask for a sample
    let input = AnalogInput::new(MAX_RAW / 2);
    let pipeline = SamplePipeline::start(EmulatedDma::new(), &SAMPLES, &LATEST)?;
    let samples = pipeline.reader();
    let _adc = converter::spawn(
        pipeline,
        input.clone(),
        Duration::from_micros(config.sample_interval_us),
    )?;

    log::info!("Connecting to the MQTT server at '{}'...", config.broker);
    let mqttoptions = mqtt::options(&config, &device_id, &namespace)?;
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 16);

    let mut node = Node::new(node_config, MqttTransport::new(client), HostBoard::new(), samples)?;
    node.start();

    let mut console = console::spawn()?;
    let mut console_open = true;

    while !node.is_finished() {
        tokio::select! {
            event = eventloop.poll() => {
                let result = mqtt::deliver(&mut node, &event);
                config.failure_policy.apply(result)?;
            }
            command = console.recv(), if console_open => match command {
                Some(Command::Press) => {
                    let outcome = node.on_button_edge();
                    log::debug!("Button press: {outcome:?}");
                }
                Some(Command::SetInput(level)) => {
                    log::info!("Analog input set to {level}");
                    input.set(level);
                }
                None => console_open = false,
            },
        }
    }

    log::info!("mqtt client exiting");
    Ok(())
}
