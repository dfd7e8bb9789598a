mod endpoint_flows;
