// Attaches to a running JVM and counts invocations of the given methods for a few seconds.
//
// Start the target with a debug agent, e.g.
//   java -agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=5005 -cp . p.Main
// then run
//   INVOCATION_METER_PORT=5005 INVOCATION_METER_VERBOSE=true \
//     cargo run --example count_invocations -- 10 "p.Point#hashCode() int" \
//     "p.Point#equals(java.lang.Object) boolean"

use anyhow::{bail, Context, Result};
use invocount::{InvocationCountMeter, Meter, MeterConfig, MethodDescriptor, SampleStatus};
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let seconds: u64 = args
        .next()
        .context("usage: count_invocations <seconds> <Owner#method(Types) Ret>...")?
        .parse()
        .context("<seconds> must be a whole number")?;
    let methods = args
        .map(|arg| arg.parse::<MethodDescriptor>())
        .collect::<Result<Vec<_>, _>>()?;
    if methods.is_empty() {
        bail!("no methods to instrument");
    }

    let config = MeterConfig::from_env().context("INVOCATION_METER_PORT must be set")?;
    println!("Attaching to {}:{}", config.host, config.port);
    let mut meter = InvocationCountMeter::new(config, methods)?;

    meter.start().await?;
    println!("Counting for {seconds}s");
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    meter.stop().await?;

    let sample = meter.sample()?;
    match sample.status() {
        SampleStatus::Valid => println!("Total invocations: {}", sample.total()),
        SampleStatus::Degraded { reason } => {
            println!("Total invocations: {} (partial: {reason})", sample.total())
        }
        SampleStatus::TimedOut => println!("Target went silent; no valid count"),
    }

    meter.dispose().await?;
    Ok(())
}
