extern crate afpacket_bridge;
extern crate num_cpus;

use std::env;
use std::thread;

use afpacket_bridge::{
    AdmitAll, CompiledFilter, Engine, FanoutConfig, FanoutFlags, FanoutType, FilterCompiler,
    FilterError, Mode, ModuleConfig, Options, Verdict,
};

/// No filter expression support in this example; every worker admits
/// everything and leaves the decision to whatever inspects `msg.data()`.
struct NoopCompiler;

impl FilterCompiler for NoopCompiler {
    fn compile(
        &self,
        _snaplen: u32,
        _datalink_type: i32,
        _expr: &str,
    ) -> Result<Box<dyn CompiledFilter>, FilterError> {
        Ok(Box::new(AdmitAll))
    }
}

/// One context per worker, all joining the same kernel fan-out group on
/// `interface` so the kernel load-balances across them instead of every
/// worker seeing every packet.
fn worker(idx: usize, interface: String) {
    let config = ModuleConfig {
        input: interface,
        mode: Mode::Passive,
        snaplen: 65535,
        poll_timeout_ms: -1,
        options: Options {
            buffer_size_mb: None,
            debug: false,
            fanout: Some(FanoutConfig {
                fanout_type: FanoutType::Hash,
                flags: FanoutFlags::empty(),
            }),
        },
    };

    let mut engine = match Engine::initialize(config, Box::new(NoopCompiler)) {
        Ok(e) => e,
        Err(err) => {
            eprintln!("start worker #{} failure: {}", idx, err);
            return;
        }
    };

    if let Err(err) = engine.start() {
        eprintln!("start worker #{} failure: {}", idx, err);
        return;
    }

    loop {
        match engine.msg_receive() {
            Ok(Some(msg)) => {
                let _payload = msg.data();
                // do something

                let _ = engine.msg_finalize(msg, Verdict::Pass);
            }
            Ok(None) => {
                // poll timed out or the loop was asked to break
            }
            Err(err) => {
                eprintln!("worker #{} receive error: {}", idx, err);
            }
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    for idx in 0..num_cpus::get() {
        let interface = args[1].clone();
        thread::spawn(move || worker(idx, interface));
    }
    // keep main thread alive
    loop {
        thread::sleep(std::time::Duration::from_secs(1));
    }
}
