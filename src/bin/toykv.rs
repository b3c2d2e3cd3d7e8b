/*
 * toykv is a replica of a distributed in-memory key/value store. The process
 * launcher passes the simulator's UDP port, the replica's own ID, and the
 * IDs of its peers. The replica joins the cluster, participates in leader
 * elections and log replication, and serves client get/put requests until
 * killed.
 */

#![warn(clippy::all)]

use toykv::error::Result;
use toykv::Server;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A replicated in-memory key/value store")
        .arg(
            clap::Arg::new("port")
                .help("UDP port of the simulator endpoint on localhost")
                .required(true)
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(clap::Arg::new("id").help("Replica ID").required(true))
        .arg(clap::Arg::new("peers").help("Peer replica IDs").num_args(0..))
        .arg(
            clap::Arg::new("log-level")
                .short('l')
                .long("log-level")
                .help("Log level")
                .default_value("info"),
        )
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("toykv");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let port = *args.get_one::<u16>("port").unwrap();
    let id = args.get_one::<String>("id").unwrap().clone();
    if id == "FFFF" {
        return toykv::errinput!("replica ID can't be the broadcast address");
    }
    let peers = args.get_many::<String>("peers").unwrap_or_default().cloned().collect();

    Server::new(id, peers, port)?.serve()
}
